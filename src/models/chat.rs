use chrono::{ DateTime, Utc };
use serde::{ de, Deserialize, Deserializer, Serialize };
use std::cmp::Ordering;

// Root collation order of the punctuation a username can contain, lowest first.
const PUNCTUATION_ORDER: &str = "_-,;:!?.'\"()[]{}@*/\\&#%`^+<=>|~$";

/// Room name shared by both participants: the two usernames sorted and joined by `_`.
///
/// Sorting uses the same locale collation as the web client, so `Bob` and `alice` meet in
/// `alice_Bob` whichever side computes it.
pub fn room_name(local: &str, peer: &str) -> String {
    let mut pair = [local, peer];
    pair.sort_unstable_by(|a, b| collate(a, b));
    pair.join("_")
}

fn primary_weight(c: char) -> (u8, u32) {
    if c.is_whitespace() {
        (0, c as u32)
    } else if let Some(rank) = PUNCTUATION_ORDER.find(c) {
        (1, rank as u32)
    } else if c.is_numeric() {
        (3, c as u32)
    } else if c.is_alphabetic() {
        (4, c.to_lowercase().next().unwrap_or(c) as u32)
    } else {
        (2, c as u32)
    }
}

/// Case-insensitive first; on a tie lowercase sorts before uppercase.
fn collate(a: &str, b: &str) -> Ordering {
    a.chars()
        .map(primary_weight)
        .cmp(b.chars().map(primary_weight))
        .then_with(|| a.chars().map(char::is_uppercase).cmp(b.chars().map(char::is_uppercase)))
        .then_with(|| a.cmp(b))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(
        default,
        alias = "_id",
        deserialize_with = "deserialize_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sender: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,
    #[serde(
        default,
        deserialize_with = "deserialize_created_at",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_from(&self, username: &str) -> bool {
        self.sender == username
    }
}

/// Payload accepted by both the live channel and `POST chat/messages/{room}/`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    pub sender: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where D: Deserializer<'de>
{
    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Text(id)) if !id.is_empty() => Some(id),
        Some(RawId::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}

// Rows stored without a sender come back as `"sender": null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
    where D: Deserializer<'de>
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// The backend serializes a missing timestamp as "".
fn deserialize_created_at<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where D: Deserializer<'de>
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() =>
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(de::Error::custom),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_name_is_order_independent() {
        assert_eq!(room_name("bob", "alice"), "alice_bob");
        assert_eq!(room_name("alice", "bob"), "alice_bob");
        assert_eq!(room_name("zed", "zed"), "zed_zed");
    }

    #[test]
    fn room_name_matches_locale_order_for_mixed_case() {
        assert_eq!(room_name("Bob", "alice"), "alice_Bob");
        assert_eq!(room_name("alice", "Bob"), "alice_Bob");
        assert_eq!(room_name("Bob", "bob"), "bob_Bob");
        assert_eq!(room_name("Zoe", "anna"), "anna_Zoe");
    }

    #[test]
    fn room_name_orders_punctuation_before_digits_and_letters() {
        assert_eq!(room_name("user10", "user_x"), "user_x_user10");
        assert_eq!(room_name("alice.b", "alice_b"), "alice_b_alice.b");
        assert_eq!(room_name("a+b", "a@b"), "a@b_a+b");
        assert_eq!(room_name("ab", "a1"), "a1_ab");
    }

    #[test]
    fn null_sender_and_text_decode_as_empty() {
        let raw =
            r#"[{"id":"1","sender":"alice","text":"hi","created_at":""},
{"id":"2","sender":null,"text":null,"created_at":""}]"#;
        let messages: Vec<Message> = serde_json::from_str(raw).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id.as_deref(), Some("2"));
        assert_eq!(messages[1].sender, "");
        assert_eq!(messages[1].text, "");
        assert!(!messages[1].is_from("alice"));
    }

    #[test]
    fn message_accepts_backend_shape() {
        let raw =
            r#"{"id":"65f1c2","room":"alice_bob","sender":"alice","text":"hi","created_at":"2024-03-01T10:15:00.123456+00:00"}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message.id.as_deref(), Some("65f1c2"));
        assert_eq!(message.room.as_deref(), Some("alice_bob"));
        assert!(message.is_from("alice"));
        assert_eq!(message.created_at.unwrap().to_rfc3339(), "2024-03-01T10:15:00.123456+00:00");
    }

    #[test]
    fn message_id_variants() {
        let numeric: Message = serde_json::from_str(r#"{"id":1,"sender":"a","text":"x"}"#).unwrap();
        assert_eq!(numeric.id.as_deref(), Some("1"));

        let raw_key: Message = serde_json::from_str(r#"{"_id":"abc","sender":"a","text":"x"}"#).unwrap();
        assert_eq!(raw_key.id.as_deref(), Some("abc"));

        let null: Message = serde_json::from_str(r#"{"id":null,"sender":"a","text":"x"}"#).unwrap();
        assert_eq!(null.id, None);

        let absent: Message = serde_json::from_str(r#"{"sender":"a","text":"x"}"#).unwrap();
        assert_eq!(absent.id, None);
    }

    #[test]
    fn empty_created_at_is_absent() {
        let message: Message = serde_json
            ::from_str(r#"{"id":"1","sender":"a","text":"x","created_at":""}"#)
            .unwrap();
        assert_eq!(message.created_at, None);
    }
}
