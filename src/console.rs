//! Operator console on the serial port.
//!
//! Single-key commands, no line editing:
//!
//! | Key | Action                         |
//! |-----|--------------------------------|
//! | `s` | start charging (local idTag)   |
//! | `t` | emergency stop                 |
//! | `w` | save configuration now         |
//! | `h` | print this help                |
//!
//! Start requests are validated by the comm thread, not here.

use log::info;

use crate::app::commands::AppCommand;

pub const HELP: &str = "keys: s=start  t=emergency stop  w=save config  h=help";

/// Result of feeding one input byte.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Command(AppCommand),
    Help,
    Ignored,
}

/// Map one byte from the serial console.
pub fn parse_key(byte: u8) -> ConsoleInput {
    match byte.to_ascii_lowercase() {
        b's' => ConsoleInput::Command(AppCommand::OperatorStart),
        b't' => ConsoleInput::Command(AppCommand::EmergencyStop),
        b'w' => ConsoleInput::Command(AppCommand::SaveConfig),
        b'h' | b'?' => ConsoleInput::Help,
        _ => ConsoleInput::Ignored,
    }
}

/// Feed a chunk of console input, forwarding commands to `send`.
/// Returns how many commands were produced.
pub fn feed(bytes: &[u8], mut send: impl FnMut(AppCommand)) -> usize {
    let mut n = 0;
    for &b in bytes {
        match parse_key(b) {
            ConsoleInput::Command(cmd) => {
                info!("CONSOLE | {cmd:?}");
                send(cmd);
                n += 1;
            }
            ConsoleInput::Help => info!("CONSOLE | {HELP}"),
            ConsoleInput::Ignored => {}
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_to_commands() {
        assert_eq!(parse_key(b's'), ConsoleInput::Command(AppCommand::OperatorStart));
        assert_eq!(parse_key(b'T'), ConsoleInput::Command(AppCommand::EmergencyStop));
        assert_eq!(parse_key(b'?'), ConsoleInput::Help);
        assert_eq!(parse_key(b'\n'), ConsoleInput::Ignored);
    }

    #[test]
    fn feed_skips_noise() {
        let mut got = Vec::new();
        assert_eq!(feed(b"x s\r\nt", |c| got.push(c)), 2);
        assert_eq!(got, vec![AppCommand::OperatorStart, AppCommand::EmergencyStop]);
    }
}
