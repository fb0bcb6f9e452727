// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! The three threaded pipeline stages and the messages that connect them.

pub mod command_source;
pub mod message;
pub mod resource_manager;
pub mod response_sink;

pub use command_source::CommandSource;
pub use message::InboundMessage;
pub use message::OutboundMessage;
pub use message::Runnable;
pub use message::Sink;
pub use resource_manager::ResourceManager;
pub use response_sink::ResponseSink;
