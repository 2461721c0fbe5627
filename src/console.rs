use chrono::Local;
use log::{ info, warn };
use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::BackendClient;
use crate::live::WsConnector;
use crate::models::account::{ Profile, UserSummary };
use crate::models::chat::Message;
use crate::transport::{ ChatSnapshot, ChatTransport, TransportEvent };

const QUIT_COMMAND: &str = "/quit";
const OUTGOING_BUFFER: usize = 32;

pub fn format_message(message: &Message, local_user: &str) -> String {
    let who = if message.is_from(local_user) { "You" } else { message.sender.as_str() };
    match message.created_at {
        Some(created_at) =>
            format!("[{}] {}: {}", created_at.with_timezone(&Local).format("%H:%M"), who, message.text),
        None => format!("{}: {}", who, message.text),
    }
}

/// Everyone in the directory except the signed-in user.
pub fn directory_entries<'a>(users: &'a [UserSummary], me: &str) -> Vec<&'a UserSummary> {
    users
        .iter()
        .filter(|user| user.username != me)
        .collect()
}

pub fn print_directory(users: &[UserSummary], me: &str) {
    let others = directory_entries(users, me);
    println!("Members ({} besides you)", others.len());
    for user in others {
        match user.avatar_url() {
            Some(avatar) => println!("  {} <{}>  {}", user.username, user.email, avatar),
            None => println!("  {} <{}>", user.username, user.email),
        }
    }
}

pub fn print_profile(profile: &Profile) {
    println!("Username: {}", profile.username);
    println!("Email:    {}", profile.email);
    println!("Bio:      {}", profile.bio.as_deref().unwrap_or(""));
    if let Some(url) = profile.avatar_url.as_deref().filter(|u| !u.is_empty()) {
        println!("Avatar:   {}", url);
    }
}

/// Prints each history entry once, whether it arrived by refresh, echo or HTTP send.
pub struct HistoryPrinter {
    local_user: String,
    printed: HashSet<String>,
}

impl HistoryPrinter {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self { local_user: local_user.into(), printed: HashSet::new() }
    }

    fn key(message: &Message) -> String {
        match &message.id {
            Some(id) => id.clone(),
            None => format!("{}|{}|{:?}", message.sender, message.text, message.created_at),
        }
    }

    /// Lines for messages in `snapshot` not printed yet.
    pub fn pending_lines(&mut self, snapshot: &ChatSnapshot) -> Vec<String> {
        let mut lines = Vec::new();
        for message in &snapshot.messages {
            if self.printed.insert(Self::key(message)) {
                lines.push(format_message(message, &self.local_user));
            }
        }
        lines
    }

    pub fn handle(&mut self, event: &TransportEvent, snapshot: &ChatSnapshot) {
        match event {
            TransportEvent::HistoryReplaced | TransportEvent::MessageAppended(_) => {
                for line in self.pending_lines(snapshot) {
                    println!("{}", line);
                }
            }
            TransportEvent::StatusChanged(status) => println!("[{}]", status.label()),
            TransportEvent::AdvisoryChanged(Some(advisory)) => println!("! {}", advisory),
            TransportEvent::HistoryErrorChanged(Some(history_error)) => {
                println!("! {}", history_error)
            }
            TransportEvent::LoadingChanged(true) => println!("Loading history..."),
            _ => {}
        }
    }
}

/// Sends queued lines one at a time, in input order, off the rendering loop.
///
/// Dropping the returned sender lets the task finish once the queue is drained.
pub fn spawn_sender(transport: Arc<ChatTransport>) -> (mpsc::Sender<String>, JoinHandle<()>) {
    let (outgoing, mut queued) = mpsc::channel::<String>(OUTGOING_BUFFER);
    let task = tokio::spawn(async move {
        while let Some(line) = queued.recv().await {
            if let Err(e) = transport.send_message(&line).await {
                warn!("Send failed: {}", e);
            }
        }
    });
    (outgoing, task)
}

pub async fn run_chat(
    client: Arc<BackendClient>,
    me: &UserSummary,
    peer: &str,
    ws_base: &str
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let connector = WsConnector::new(ws_base, client.session_cookie())?;
    let transport = Arc::new(ChatTransport::new(me.username.clone(), client, Arc::new(connector)));
    let mut events = transport.subscribe();
    let room = transport.open_conversation(peer);
    println!("Chatting with {} (room {}). Type {} to leave.", peer, room, QUIT_COMMAND);

    let (outgoing, sender) = spawn_sender(Arc::clone(&transport));

    let mut printer = HistoryPrinter::new(transport.local_user());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim() == QUIT_COMMAND => break Ok(()),
                    Ok(Some(line)) => {
                        if outgoing.send(line).await.is_err() {
                            warn!("Send queue closed, leaving room {}", room);
                            break Ok(());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => printer.handle(&event, &transport.snapshot()),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Display fell behind by {} events, catching up", skipped);
                        for line in printer.pending_lines(&transport.snapshot()) {
                            println!("{}", line);
                        }
                    }
                    Err(RecvError::Closed) => break Ok(()),
                }
            }
        }
    };

    // Let queued lines go out before the conversation is torn down.
    drop(outgoing);
    if let Err(e) = sender.await {
        warn!("Send task ended abnormally: {}", e);
    }
    if let Some(left) = transport.room() {
        info!("Left room {}", left);
    }
    transport.close_conversation();
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: Option<&str>, sender: &str, text: &str) -> Message {
        Message {
            id: id.map(str::to_string),
            room: None,
            sender: sender.to_string(),
            text: text.to_string(),
            created_at: None,
        }
    }

    fn user(id: i64, username: &str) -> UserSummary {
        UserSummary {
            id,
            username: username.to_string(),
            email: format!("{}@example.com", username),
            avatar: Some(String::new()),
        }
    }

    #[test]
    fn own_messages_are_labelled_you() {
        assert_eq!(format_message(&message(Some("1"), "bob", "hey"), "bob"), "You: hey");
        assert_eq!(format_message(&message(Some("2"), "alice", "hi"), "bob"), "alice: hi");
    }

    #[test]
    fn directory_excludes_self() {
        let users = vec![user(1, "alice"), user(2, "bob"), user(3, "carol")];
        let names: Vec<&str> = directory_entries(&users, "bob")
            .into_iter()
            .map(|u| u.username.as_str())
            .collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn queued_sends_do_not_block_and_keep_order() {
        use std::time::Duration;
        use wiremock::matchers::{ method, path };
        use wiremock::{ Mock, MockServer, ResponseTemplate };

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/messages/alice_bob/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/chat/messages/alice_bob/"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_delay(Duration::from_millis(300))
                    .set_body_json(serde_json::json!({ "sender": "bob", "text": "stored" }))
            )
            .expect(2)
            .mount(&server).await;

        // Nothing listens here, so every send takes the HTTP path.
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let connector = WsConnector::new(&format!("ws://127.0.0.1:{}/ws", port), None).unwrap();
        let client = Arc::new(BackendClient::new(&format!("{}/api", server.uri())).unwrap());
        let transport = Arc::new(ChatTransport::new("bob", client, Arc::new(connector)));
        transport.open_conversation("alice");

        let (outgoing, task) = spawn_sender(Arc::clone(&transport));
        let queued = tokio::time::timeout(Duration::from_millis(100), async {
            outgoing.send("first".to_string()).await.unwrap();
            outgoing.send("second".to_string()).await.unwrap();
        }).await;
        assert!(queued.is_ok());

        drop(outgoing);
        task.await.unwrap();

        let posted: Vec<String> = server
            .received_requests().await
            .unwrap()
            .into_iter()
            .filter(|request| request.method.as_str() == "POST")
            .map(|request| {
                let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
                body["text"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(posted, vec!["first", "second"]);
        transport.close_conversation();
    }

    #[test]
    fn printer_emits_each_message_once() {
        let mut printer = HistoryPrinter::new("bob");
        let mut snapshot = ChatSnapshot {
            messages: vec![message(Some("1"), "alice", "hi")],
            ..ChatSnapshot::default()
        };
        assert_eq!(printer.pending_lines(&snapshot), vec!["alice: hi"]);

        snapshot.messages.push(message(Some("2"), "bob", "hello"));
        assert_eq!(printer.pending_lines(&snapshot), vec!["You: hello"]);
        assert!(printer.pending_lines(&snapshot).is_empty());
    }
}
