//! Wire envelopes of the `proximo` package.
//!
//! Field numbers match `proto/proximo.proto`.

use crate::session;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(string, tag = "2")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Confirmation {
    #[prost(string, tag = "1")]
    pub msg_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartConsumeRequest {
    #[prost(string, tag = "1")]
    pub topic: String,
    #[prost(string, tag = "2")]
    pub consumer: String,
    #[prost(enumeration = "Offset", tag = "3")]
    pub initial_offset: i32,
}

/// First request carries `start_request`, every later one a `confirmation`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsumerRequest {
    #[prost(message, optional, tag = "1")]
    pub start_request: Option<StartConsumeRequest>,
    #[prost(message, optional, tag = "2")]
    pub confirmation: Option<Confirmation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartPublishRequest {
    #[prost(string, tag = "1")]
    pub topic: String,
}

/// First request carries `start_request`, every later one a `msg`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublisherRequest {
    #[prost(message, optional, tag = "1")]
    pub start_request: Option<StartPublishRequest>,
    #[prost(message, optional, tag = "2")]
    pub msg: Option<Message>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Offset {
    Default = 0,
    Newest = 1,
    Oldest = 2,
}

impl StartConsumeRequest {
    /// Unknown offset values fall back to the backend default
    pub fn offset(&self) -> session::Offset {
        match Offset::try_from(self.initial_offset) {
            Ok(Offset::Newest) => session::Offset::Newest,
            Ok(Offset::Oldest) => session::Offset::Oldest,
            Ok(Offset::Default) | Err(_) => session::Offset::Default,
        }
    }

    pub fn into_config(self) -> session::ConsumerConfig {
        let offset = self.offset();
        session::ConsumerConfig::new(self.consumer, self.topic).with_offset(offset)
    }
}

impl From<session::Offset> for Offset {
    fn from(offset: session::Offset) -> Self {
        match offset {
            session::Offset::Default => Offset::Default,
            session::Offset::Newest => Offset::Newest,
            session::Offset::Oldest => Offset::Oldest,
        }
    }
}

impl From<session::Message> for Message {
    fn from(msg: session::Message) -> Self {
        Self {
            data: msg.data,
            id: msg.id,
        }
    }
}

impl From<Message> for session::Message {
    fn from(msg: Message) -> Self {
        Self {
            data: msg.data,
            id: msg.id,
        }
    }
}

impl From<session::Confirmation> for Confirmation {
    fn from(confirmation: session::Confirmation) -> Self {
        Self {
            msg_id: confirmation.msg_id,
        }
    }
}

impl From<Confirmation> for session::Confirmation {
    fn from(confirmation: Confirmation) -> Self {
        Self {
            msg_id: confirmation.msg_id,
        }
    }
}
