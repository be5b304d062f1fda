//! Parloir is a streaming chat relay for site-chat widgets, with a library
//! model of the widget itself.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the conversation model: messages, delta application, the
//!   observable conversation store, the streaming transport adapter, and the
//!   widget session that ties them together.
//! - [`relay`] is the server: one route that accepts a widget turn and
//!   answers with typed frames over SSE, forwarding to an OpenAI-compatible
//!   provider behind the scenes.
//! - [`api`] defines the wire payloads on both sides of the relay: widget
//!   frames toward the client and chat-completions payloads toward the
//!   provider.
//! - [`cli`] parses arguments and dispatches into [`relay::serve`] or the
//!   line-mode client in [`cli::chat`].
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod relay;
pub mod utils;
