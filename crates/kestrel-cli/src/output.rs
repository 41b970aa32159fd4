//! Relay-style output lines on stdout.

use std::io::{self, Write as _};

use kestrel_core::SubId;

pub fn event(sub_id: &SubId, json: &str) -> io::Result<()> {
  let sub = serde_json::Value::from(sub_id.as_str());
  writeln!(io::stdout().lock(), "[\"EVENT\",{sub},{json}]")
}

pub fn eose(sub_id: &SubId) -> io::Result<()> {
  let sub = serde_json::Value::from(sub_id.as_str());
  writeln!(io::stdout().lock(), "[\"EOSE\",{sub}]")
}

pub fn notice(message: &str) -> io::Result<()> {
  let message = serde_json::Value::from(message);
  writeln!(io::stdout().lock(), "[\"NOTICE\",{message}]")
}
