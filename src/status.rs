// src/status.rs
//! `"<code>--<message>[--<extra>...]"` strings handed to whatever front door
//! invokes the handlers.

pub const BAD_REQUEST: u16 = 400;
pub const INTERNAL_SERVER_ERROR: u16 = 500;

pub fn status_message(code: u16, message: &str, extras: &[&str]) -> String {
    let mut out = format!("{}--{}", code, message);
    for extra in extras {
        out.push_str("--");
        out.push_str(extra);
    }
    out
}
