use super::super::{connection::error::Error as ConnectionError, sender::SenderConnection};
use crate::{voice::ConnectionInfo, ws::WsStream, Config};
use flume::Sender;

#[derive(Debug)]
pub(crate) enum CoreMessage {
    ConnectWithResult(ConnectionInfo, Sender<Result<(), ConnectionError>>),
    Disconnect,
    SetConfig(Config),
    SetPaused(bool),
    Mute(bool),
    /// The control channel dropped in a way that allows a resume.
    Reconnect,
    /// The media transport failed, or a resume is not possible.
    FullReconnect,
    /// The control channel closed with a code which ends the session.
    SignalWsClosure(Option<u16>),
    Poison,
}

pub(crate) enum WsMessage {
    Ws(Box<WsStream>),
    SetKeepalive(f64),
    Speaking(bool),
}

pub(crate) enum SenderMessage {
    SetConn(SenderConnection),
    DropConn,
    Ws(Option<Sender<WsMessage>>),
    SetConfig(Config),
    SetPaused(bool),
    Mute(bool),
    Poison,
}
