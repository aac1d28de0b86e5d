//! Sentences about observed network activity.
//!
//! An event names a client address, an activity kind and an optional
//! argument:
//!
//! ```text
//! 192.168.123.109 web example.org
//! 192.168.123.106 search rust lifetimes
//! 192.168.123.105 dropbox-lan
//! ```
//!
//! The composer turns it into one sentence ("js looks at example.org")
//! and publishes it to the message board, so the next relay exchange
//! shows it on the reader. Client addresses are replaced by their
//! configured display name. Some activities are noise (CDN and ad-server
//! traffic) and compose to nothing.
//!
//! Capturing the traffic is someone else's job; events arrive as text.

use crate::backend::MessageBoard;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, trace};

/// Web hosts that only serve assets or ads
const WEB_NOISE: [&str; 3] = ["ytimg", "gstatic", "doubleclick"];

/// TLS hosts not worth a sentence of their own
const SECURE_NOISE: [&str; 2] = ["1e100", "evernote"];

/// Address to display name lookup.
#[derive(Debug, Clone, Default)]
pub struct HostDict {
    names: HashMap<String, String>,
}

impl HostDict {
    pub fn new(names: HashMap<String, String>) -> Self {
        HostDict { names }
    }

    /// Display name for `addr`, or `addr` itself when unknown.
    pub fn name_of<'a>(&'a self, addr: &'a str) -> &'a str {
        self.names.get(addr).map(String::as_str).unwrap_or(addr)
    }
}

/// What a client was seen doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Web { server: String },
    Secure { server: String },
    Search { query: String },
    DropboxLan,
    DropboxWeb,
    Youtube { title: Option<String> },
    Facebook,
    Mail { server: String },
    Evernote,
    Advertising,
    Wikipedia { topic: String },
}

/// One observation: `client` did `activity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub client: String,
    pub activity: Activity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventParseError {
    Empty,
    MissingKind,
    UnknownKind(String),
    MissingArgument(&'static str),
}

impl fmt::Display for EventParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventParseError::Empty => write!(f, "empty event"),
            EventParseError::MissingKind => write!(f, "missing activity kind"),
            EventParseError::UnknownKind(kind) => write!(f, "unknown activity '{kind}'"),
            EventParseError::MissingArgument(kind) => write!(f, "'{kind}' needs an argument"),
        }
    }
}

impl std::error::Error for EventParseError {}

impl FromStr for Event {
    type Err = EventParseError;

    /// `<client> <kind> [argument...]`; the argument runs to end of line.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (client, rest) = split_word(line);
        if client.is_empty() {
            return Err(EventParseError::Empty);
        }
        let (kind, argument) = split_word(rest);
        if kind.is_empty() {
            return Err(EventParseError::MissingKind);
        }

        let required = |name: &'static str| {
            if argument.is_empty() {
                Err(EventParseError::MissingArgument(name))
            } else {
                Ok(argument.to_string())
            }
        };

        let activity = match kind {
            "web" => Activity::Web {
                server: required("web")?,
            },
            "ssl" => Activity::Secure {
                server: required("ssl")?,
            },
            "search" => Activity::Search {
                query: required("search")?,
            },
            "dropbox-lan" => Activity::DropboxLan,
            "dropbox-web" => Activity::DropboxWeb,
            "youtube" => Activity::Youtube {
                title: (!argument.is_empty()).then(|| argument.to_string()),
            },
            "facebook" => Activity::Facebook,
            "imap" => Activity::Mail {
                server: required("imap")?,
            },
            "evernote" => Activity::Evernote,
            "ads" => Activity::Advertising,
            "wikipedia" => Activity::Wikipedia {
                topic: required("wikipedia")?,
            },
            other => return Err(EventParseError::UnknownKind(other.to_string())),
        };

        Ok(Event {
            client: client.to_string(),
            activity,
        })
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

/// Writes sentences for events onto the message board.
pub struct Composer {
    hosts: HostDict,
    board: Arc<MessageBoard>,
}

impl Composer {
    pub fn new(hosts: HostDict, board: Arc<MessageBoard>) -> Self {
        Composer { hosts, board }
    }

    /// Sentence for `event`, picking a random phrasing where there are several.
    pub fn compose(&self, event: &Event) -> Option<String> {
        self.compose_with(event, |choices| rand::random_range(0..choices))
    }

    /// Sentence for `event`; `pick(n)` chooses one of `n` phrasings.
    pub fn compose_with(
        &self,
        event: &Event,
        pick: impl FnOnce(usize) -> usize,
    ) -> Option<String> {
        let client = self.hosts.name_of(&event.client);

        let sentence = match &event.activity {
            Activity::Web { server } => {
                if WEB_NOISE.iter().any(|noise| server.contains(noise)) {
                    return None;
                }
                format!("{client} looks at {server}")
            }
            Activity::Secure { server } => {
                if SECURE_NOISE.iter().any(|noise| server.contains(noise)) {
                    return None;
                }
                match pick(3) % 3 {
                    0 => format!("{client} secrets are at {server}"),
                    1 => format!("At {server} {client} hides their secrets"),
                    _ => format!("{server} says Hello Client!###{client} says Hello Server"),
                }
            }
            Activity::Search { query } => format!("{client} searched for »{query}«."),
            Activity::DropboxLan => format!("{client}'s Dropbox is looking for friends."),
            Activity::DropboxWeb => {
                format!("{client}'s Dropbox checks for updates on the interwebz.")
            }
            Activity::Youtube { title: Some(title) } => {
                format!("{client} is watching {title} on youtube.")
            }
            Activity::Youtube { title: None } => format!("{client} is watching youtube."),
            Activity::Facebook => match pick(2) % 2 {
                0 => format!("{client} procrastinates at facebook."),
                _ => format!("{client} visits their friends at facebook."),
            },
            Activity::Mail { server } => {
                let server = if server.contains("1e100") {
                    "googlemail"
                } else {
                    server.as_str()
                };
                format!("{client} checks mails at {server}")
            }
            Activity::Evernote => format!("{client} is writing something down on Evernote"),
            Activity::Advertising => format!("{client} got some nice Ad-Banners"),
            Activity::Wikipedia { topic } => {
                format!("{client} learns on wikipedia something about »{topic}«")
            }
        };

        Some(sentence)
    }

    /// Compose and publish. Returns whether the board changed.
    pub fn publish(&self, event: &Event) -> bool {
        match self.compose(event) {
            Some(sentence) => {
                self.board.publish(sentence);
                true
            }
            None => {
                trace!(client = %event.client, activity = ?event.activity, "Event ignored");
                false
            }
        }
    }
}

/// Publish a sentence for every event line of `reader` until EOF.
/// Lines that do not parse are logged and skipped.
pub async fn feed_events<R>(reader: R, composer: &Composer) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut published = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Event>() {
            Ok(event) => {
                if composer.publish(&event) {
                    published += 1;
                }
            }
            Err(e) => debug!(error = %e, %line, "Skipping event"),
        }
    }

    debug!(published, "Event input closed");
    Ok(published)
}
