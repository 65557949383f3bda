//! Stdout helpers for the plugin side.
//!
//! stdout carries only the handshake line and `describe` output; logs go to
//! stderr. Never use `println!` for these: it may add `\r\n` on Windows.

use std::io::Write;

/// Write `line` followed by a single `\n` and flush.
///
/// The orchestrator waits for a complete line, so the flush is required.
pub fn write_stdout_line(line: &str) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()?;
    Ok(())
}

/// Write a JSON value to stdout as a single line.
pub fn write_stdout_json<T: serde::Serialize>(value: &T) -> crate::error::Result<()> {
    let json = serde_json::to_string(value)?;
    write_stdout_line(&json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_stdout_line_does_not_panic() {
        assert!(write_stdout_line("5|0|tcp|127.0.0.1:10000").is_ok());
    }

    #[test]
    fn test_write_stdout_json_serializes() {
        let value = serde_json::json!({ "builders": ["default"] });
        assert!(write_stdout_json(&value).is_ok());
    }
}
