use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

enum ProxyMessage {
    Payload(String),
    Stop,
}

/// Topic-prefix pub/sub over in-process channels.
///
/// Publishers send `"{topic}{subtopic} {payload}"` lines into the frontend;
/// a single proxy thread owns both ends and forwards each line to every
/// subscriber whose topic is a prefix of the line's first space-delimited
/// token. Used for loosely-coupled cross-stage notifications.
pub struct Bus {
    frontend: Sender<ProxyMessage>,
    subscribers: Arc<Mutex<Vec<(String, Sender<String>)>>>,
}

impl Bus {
    /// Returns the bus plus the proxy thread's join handle.
    pub fn start() -> (Bus, JoinHandle<()>) {
        let (frontend, backend) = unbounded::<ProxyMessage>();
        let subscribers: Arc<Mutex<Vec<(String, Sender<String>)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let proxy_subscribers = subscribers.clone();
        let proxy = std::thread::Builder::new()
            .name("bus-proxy".to_owned())
            .spawn(move || {
                for message in backend {
                    let line = match message {
                        ProxyMessage::Payload(line) => line,
                        ProxyMessage::Stop => break,
                    };
                    let token = line.split(' ').next().unwrap_or("");
                    proxy_subscribers.lock().unwrap().retain(|(topic, tx)| {
                        if token.starts_with(topic.as_str()) {
                            // A closed receiver drops out of the registry.
                            tx.send(line.clone()).is_ok()
                        } else {
                            true
                        }
                    });
                }
                debug!("bus proxy exited");
            })
            .expect("failed to spawn bus proxy");

        (
            Bus {
                frontend,
                subscribers,
            },
            proxy,
        )
    }

    pub fn publisher(&self, topic: impl Into<String>) -> Publisher {
        Publisher {
            topic: topic.into(),
            frontend: self.frontend.clone(),
        }
    }

    pub fn subscriber(&self, topic: impl Into<String>) -> Subscriber {
        let (tx, rx) = unbounded();
        let topic = topic.into();
        self.subscribers.lock().unwrap().push((topic.clone(), tx));
        Subscriber { topic, rx }
    }

    pub fn stop(&self) {
        let _ = self.frontend.send(ProxyMessage::Stop);
    }
}

pub struct Publisher {
    topic: String,
    frontend: Sender<ProxyMessage>,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn publish(&self, sub_topic: &str, payload: &str) {
        let _ = self
            .frontend
            .send(ProxyMessage::Payload(format!(
                "{}{} {}",
                self.topic, sub_topic, payload
            )));
    }
}

pub struct Subscriber {
    topic: String,
    rx: Receiver<String>,
}

impl Subscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `(first token, payload)` of the next matching line, or `None` on
    /// timeout or a stopped bus.
    pub fn check_for_updates(&self, timeout: Duration) -> Option<(String, String)> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => {
                let (token, payload) = line.split_once(' ').unwrap_or(("", line.as_str()));
                Some((token.to_owned(), payload.to_owned()))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}
