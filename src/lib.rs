//! Narrator: scenario workflow engine for long-running role-play chats.
//!
//! Before a chat request is forwarded upstream, a bounded two-stage agent
//! pipeline recalls earlier facts and updates a persistent, schema-checked
//! table store describing the story world. The resulting scenario is
//! injected ahead of the user's message.
//!
//! # Quick Start
//!
//! ```no_run
//! use narrator::prelude::*;
//!
//! # async fn example() -> narrator::error::Result<()> {
//! let config = NarratorConfig::load(None)?;
//! let narrator = Narrator::from_config(config)?;
//! let messages = vec![
//!     ChatMessage::user("We enter the forest."),
//!     ChatMessage::assistant("A dragon sleeps beneath the oaks."),
//!     ChatMessage::user("I draw my sword."),
//! ];
//! if let Prepared::Forward { messages, .. } = narrator.prepare("session-1", &messages).await? {
//!     println!("{}", messages.last().map(|m| m.content.as_str()).unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod knowledge;
pub mod prelude;
pub mod provider;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod stream_transform;
pub mod tools;
pub mod types;
pub mod util;
pub mod workflow;

#[cfg(feature = "cli")]
pub mod cli;
