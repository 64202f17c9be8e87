//! Socket status word layout

use super::SocketState;

pub(crate) const CONNECTING: u32 = 1 << 0;
pub(crate) const CONNECTED: u32 = 1 << 1;
pub(crate) const DONE_READING: u32 = 1 << 2;
pub(crate) const DONE_WRITING: u32 = 1 << 3;
pub(crate) const STATE_MASK: u32 = CONNECTING | CONNECTED | DONE_READING | DONE_WRITING;

pub(crate) const INITIAL_STATE: u32 = 0;
pub(crate) const CONNECTING_STATE: u32 = CONNECTING;
pub(crate) const OPENING_STATE: u32 = CONNECTING | CONNECTED;
pub(crate) const OPENED_STATE: u32 = CONNECTED;
pub(crate) const CLOSING_STATE: u32 = CONNECTED | DONE_READING | DONE_WRITING;
pub(crate) const CLOSED_STATE: u32 = DONE_READING | DONE_WRITING;

pub(crate) const CONNECT_REQUEST: u32 = 1 << 4;
pub(crate) const OPEN_REQUEST: u32 = 1 << 5;
pub(crate) const READ_REQUEST: u32 = 1 << 6;
pub(crate) const WRITE_REQUEST: u32 = 1 << 7;
pub(crate) const BECOME_REQUEST: u32 = 1 << 8;
pub(crate) const CLOSE_INBOUND_REQUEST: u32 = 1 << 9;
pub(crate) const CLOSE_OUTBOUND_REQUEST: u32 = 1 << 10;
pub(crate) const CLOSE_REQUEST: u32 = 1 << 11;
pub(crate) const TIMEOUT_REQUEST: u32 = 1 << 12;
pub(crate) const ACCEPTED: u32 = 1 << 13;

pub(crate) const CONNECT_READY: u32 = 1 << 14;
pub(crate) const READ_READY: u32 = 1 << 15;
pub(crate) const WRITE_READY: u32 = 1 << 16;

pub(crate) const INBOUND_SHUT: u32 = 1 << 17;
pub(crate) const OUTBOUND_SHUT: u32 = 1 << 18;
pub(crate) const BOTH_SHUT: u32 = INBOUND_SHUT | OUTBOUND_SHUT;

/// Connected and past the opening phase
pub(crate) fn is_opened(status: u32) -> bool {
    status & (CONNECTING | CONNECTED) == CONNECTED
}

pub(crate) fn is_opening(status: u32) -> bool {
    status & (CONNECTING | CONNECTED) == OPENING_STATE
}

pub(crate) fn is_closed(status: u32) -> bool {
    status & STATE_MASK == CLOSED_STATE
}

pub(crate) fn state_of(status: u32) -> SocketState {
    let connecting = status & CONNECTING != 0;
    let connected = status & CONNECTED != 0;
    let done = status & CLOSED_STATE == CLOSED_STATE;
    match (connecting, connected) {
        (true, true) => SocketState::Opening,
        (true, false) => SocketState::Connecting,
        (false, true) if done => SocketState::Closing,
        (false, true) => SocketState::Opened,
        (false, false) if done => SocketState::Closed,
        (false, false) => SocketState::Initial,
    }
}
