// The externally observable output contract: protocol steps go to standard
// output, one line each, flushed immediately so interleaved processes stay
// readable. Operational diagnostics go through `tracing` instead and never
// share these line shapes.

use std::{
    fmt::Display,
    io::{stdout, Write},
};

use crate::{clock::Timestamp, mutex::PeerId};

pub fn client_text(id: PeerId, timestamp: Timestamp, message: impl Display) -> String {
    format!("[TS: {timestamp}] CLIENTE {id}: {message}")
}

pub fn server_text(timestamp: Timestamp, message: impl Display) -> String {
    format!("[TS: {timestamp}] SERVIDOR: {message}")
}

pub fn client_line(id: PeerId, timestamp: Timestamp, message: impl Display) {
    emit(&client_text(id, timestamp, message))
}

pub fn server_line(timestamp: Timestamp, message: impl Display) {
    emit(&server_text(timestamp, message))
}

fn emit(line: &str) {
    let mut out = stdout().lock();
    // nothing useful to do if stdout is gone
    writeln!(out, "{line}").and_then(|()| out.flush()).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_format() {
        assert_eq!(
            client_text(3, 17, "requesting access"),
            "[TS: 17] CLIENTE 3: requesting access"
        );
    }

    #[test]
    fn server_format() {
        assert_eq!(
            server_text(42, "confirmation sent to client 1"),
            "[TS: 42] SERVIDOR: confirmation sent to client 1"
        );
    }
}
