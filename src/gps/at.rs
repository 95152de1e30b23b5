//! AT command transaction primitive over a serial byte stream.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TrackerResult;

const IDLE_POLL: Duration = Duration::from_millis(10);
const MAX_DRAIN_BYTES: usize = 4096;

/// Outcome of one command/response exchange.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AtResponse {
    /// True when the expected token appeared before the deadline.
    pub matched: bool,
    /// Non-empty response lines in arrival order.
    pub lines: Vec<String>,
}

impl AtResponse {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn contains(&self, token: &str) -> bool {
        self.lines.iter().any(|l| l.contains(token))
    }
}

fn is_error_line(line: &str) -> bool {
    line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
}

/// Discard input already waiting on the port, such as the late tail of a
/// reply whose transaction timed out. Stops at the first empty read.
pub fn drain_input<P: Read + ?Sized>(port: &mut P) -> TrackerResult<usize> {
    let mut buf = [0u8; 256];
    let mut discarded = 0;
    while discarded < MAX_DRAIN_BYTES {
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    if discarded > 0 {
        log::debug!("Discarded {} stale byte(s) from GPS port", discarded);
    }
    Ok(discarded)
}

pub fn send_command<P: Write + ?Sized>(port: &mut P, command: &str) -> TrackerResult<()> {
    log::debug!("GPS >> {}", command);
    port.write_all(command.as_bytes())?;
    port.write_all(b"\r\n")?;
    port.flush()?;
    Ok(())
}

/// Read lines until one contains `expected`, an error line arrives, or
/// `timeout` elapses. A timeout is not an error: it yields `matched == false`.
pub fn read_until<P: Read + ?Sized>(
    port: &mut P,
    expected: &str,
    timeout: Duration,
) -> TrackerResult<AtResponse> {
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<u8> = Vec::new();
    let mut lines = Vec::new();
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        match port.read(&mut buf) {
            Ok(0) => thread::sleep(IDLE_POLL),
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    log::debug!("GPS << {}", line);
                    let hit = line.contains(expected);
                    let failed = is_error_line(&line);
                    lines.push(line);
                    if hit {
                        return Ok(AtResponse { matched: true, lines });
                    }
                    if failed {
                        return Ok(AtResponse {
                            matched: false,
                            lines,
                        });
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                thread::sleep(IDLE_POLL)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    // Unterminated trailing data still counts.
    let tail = String::from_utf8_lossy(&pending).trim().to_string();
    let mut matched = false;
    if !tail.is_empty() {
        matched = tail.contains(expected);
        lines.push(tail);
    }
    Ok(AtResponse { matched, lines })
}

/// Drain stale input, write `command` and wait for `expected`.
pub fn transaction<P: Read + Write + ?Sized>(
    port: &mut P,
    command: &str,
    expected: &str,
    timeout: Duration,
) -> TrackerResult<AtResponse> {
    drain_input(port)?;
    send_command(port, command)?;
    read_until(port, expected, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::testing::ScriptedModem;

    const SHORT: Duration = Duration::from_millis(60);

    #[test]
    fn test_transaction_matches_expected_token() {
        let mut modem = ScriptedModem::new().respond("AT+CGNSSPWR=1", "\r\nOK\r\n\r\n+CGNSSPWR: READY!\r\n");
        let resp = transaction(&mut modem, "AT+CGNSSPWR=1", "READY!", SHORT).unwrap();
        assert!(resp.matched);
        assert_eq!(resp.lines, vec!["OK", "+CGNSSPWR: READY!"]);
        assert_eq!(modem.commands(), vec!["AT+CGNSSPWR=1"]);
    }

    #[test]
    fn test_transaction_times_out_without_token() {
        let mut modem = ScriptedModem::new().respond("AT", "\r\nOK\r\n");
        let started = Instant::now();
        let resp = transaction(&mut modem, "AT", "READY!", SHORT).unwrap();
        assert!(!resp.matched);
        assert_eq!(resp.lines, vec!["OK"]);
        assert!(started.elapsed() >= SHORT);
    }

    #[test]
    fn test_error_line_ends_transaction_early() {
        let mut modem = ScriptedModem::new().respond("AT+CGNSSMODE=15", "\r\nERROR\r\n");
        let started = Instant::now();
        let resp =
            transaction(&mut modem, "AT+CGNSSMODE=15", "OK", Duration::from_secs(5)).unwrap();
        assert!(!resp.matched);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_late_reply_does_not_answer_next_command() {
        let mut modem = ScriptedModem::new().respond("AT+CGNSSMODE=3", "\r\nOK\r\n");
        // The reply to this command is never read
        send_command(&mut modem, "AT+CGNSSMODE=3").unwrap();

        let resp = transaction(&mut modem, "AT+CGNSSTST=1", "OK", SHORT).unwrap();
        assert!(!resp.matched);
        assert!(resp.lines.is_empty());
    }

    #[test]
    fn test_drain_on_idle_port_is_a_no_op() {
        let mut modem = ScriptedModem::new();
        assert_eq!(drain_input(&mut modem).unwrap(), 0);
    }

    #[test]
    fn test_unterminated_tail_is_checked() {
        let mut modem = ScriptedModem::new().respond("AT+CAGPS", "OK\r\n+AGPS: success");
        let resp = transaction(&mut modem, "AT+CAGPS", "+AGPS: success", SHORT).unwrap();
        assert!(resp.matched);
        assert!(resp.contains("OK"));
    }
}
