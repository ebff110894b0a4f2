//! Test utilities & fixtures shared by the integration tests.

use sbdlink::protocol::{Ack, Envelope, MessageType};
use sbdlink::transfer::Reassembler;
use std::path::Path;

/// Deterministic incompressible bytes (xorshift32).
#[allow(dead_code)]
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// A shell script padded with comment lines so it spans several parts.
#[allow(dead_code)]
pub fn padded_script(body: &str, lines: usize) -> Vec<u8> {
    let mut script = String::from("#!/bin/sh\n");
    for i in 0..lines {
        script.push_str(&format!("# padding line {} ................................\n", i));
    }
    script.push_str(body);
    script.push('\n');
    script.into_bytes()
}

/// Strip the envelope from a framed FILE_UPLOAD part.
#[allow(dead_code)]
pub fn upload_payload(part: &[u8]) -> &[u8] {
    let envelope = Envelope::decode(part).unwrap();
    assert_eq!(envelope.kind, MessageType::FileUpload);
    envelope.payload
}

/// Feed parts in the given order, collecting every acknowledgment produced.
#[allow(dead_code)]
pub fn feed<'a, I>(reassembler: &Reassembler, parts: I) -> Vec<Ack>
where
    I: IntoIterator<Item = &'a Vec<u8>>,
{
    parts
        .into_iter()
        .filter_map(|part| reassembler.process(upload_payload(part)).unwrap())
        .collect()
}

#[allow(dead_code)]
pub fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
