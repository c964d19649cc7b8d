//! Prefixed, time-encoded opaque identifiers.
//!
//! Every persisted record gets an id of the form
//! `<prefix><YYYYMMDDtHHMMSSz>_<base32>` where the suffix encodes ten
//! random bytes with a lowercase alphabet. The timestamp prefix keeps ids
//! roughly sortable by creation time; the random suffix makes them unique.

use chrono::Utc;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

fn base32_encode(data: &[u8]) -> String {
    let mut bits = 0u32;
    let mut value = 0u32;
    let mut out = String::new();
    for &byte in data {
        value = (value << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            let index = (value >> (bits - 5)) & 31;
            out.push(ALPHABET[index as usize] as char);
            bits -= 5;
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((value << (5 - bits)) & 31) as usize] as char);
    }
    out
}

fn new_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4();
    let enc = base32_encode(&raw.as_bytes()[..10]);
    let stamp = Utc::now().format("%Y%m%dt%H%M%Sz");
    format!("{prefix}{stamp}_{enc}")
}

pub fn new_run_id() -> String {
    new_id("run_")
}

pub fn new_step_id() -> String {
    new_id("step_")
}

pub fn new_session_id() -> String {
    new_id("sess_")
}

pub fn new_message_id() -> String {
    new_id("msg_")
}

pub fn new_turn_id() -> String {
    new_id("turn_")
}

pub fn new_tool_call_id() -> String {
    new_id("call_")
}

pub fn new_attachment_id() -> String {
    new_id("att_")
}
