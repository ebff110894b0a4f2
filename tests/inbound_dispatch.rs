//! Inbound drop to acknowledgment, end to end.

mod common;

use common::noise;
use sbdlink::inbound::{CommandHandler, Dispatcher};
use sbdlink::protocol::Ack;
use sbdlink::transfer::{encode_file_with_serial, Reassembler, TransferOptions};
use sbdlink::transport::FileDrop;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

fn dispatcher(root: &Path) -> Dispatcher {
    let reassembler = Reassembler::new(root.join("staging"), root.join("out")).unwrap();
    Dispatcher::new(
        reassembler,
        format!("{}/outbound/ack-%Y%m%d-%H%M%S.dat", root.display()),
    )
}

fn acks(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = fs::read_dir(root.join("outbound"))
        .map(|d| d.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

#[test]
fn posted_parts_produce_an_ack_file() {
    let tmp = tempdir().unwrap();
    let inbox = FileDrop::new(tmp.path().join("inbox"));
    let mut d = dispatcher(tmp.path());

    let data = noise(700, 11);
    let t = encode_file_with_serial(&data, "uploads/blob.bin", TransferOptions::default(), 9100).unwrap();
    assert!(t.parts.len() > 1);
    for part in &t.parts {
        inbox.post(part).unwrap();
    }

    assert_eq!(d.process_pending(&inbox).unwrap(), t.parts.len());
    assert!(inbox.pending().unwrap().is_empty());
    assert_eq!(fs::read(tmp.path().join("out/uploads/blob.bin")).unwrap(), data);

    let written = acks(tmp.path());
    assert_eq!(written.len(), 1);
    let ack = Ack::decode(&fs::read(&written[0]).unwrap()).unwrap();
    assert_eq!(ack.serial, 9100);
    assert!(ack.contents_ok);
    assert!(ack.process_ok);
    assert_eq!(ack.result, 0);
}

#[test]
fn two_transfers_in_one_second_get_distinct_acks() {
    let tmp = tempdir().unwrap();
    let inbox = FileDrop::new(tmp.path().join("inbox"));
    let mut d = dispatcher(tmp.path());

    for (serial, name) in [(9201, "a.txt"), (9202, "b.txt")] {
        let t = encode_file_with_serial(b"small", name, TransferOptions::default(), serial).unwrap();
        for part in &t.parts {
            inbox.post(part).unwrap();
        }
    }
    d.process_pending(&inbox).unwrap();

    let mut serials: Vec<u32> = acks(tmp.path())
        .iter()
        .map(|p| Ack::decode(&fs::read(p).unwrap()).unwrap().serial)
        .collect();
    serials.sort_unstable();
    assert_eq!(serials, vec![9201, 9202]);
}

struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

impl CommandHandler for Recorder {
    fn ccm_command(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

#[test]
fn bad_messages_do_not_block_the_queue() {
    let tmp = tempdir().unwrap();
    let inbox = FileDrop::new(tmp.path().join("inbox"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let reassembler = Reassembler::new(tmp.path().join("staging"), tmp.path().join("out")).unwrap();
    let mut d = Dispatcher::with_handler(
        reassembler,
        format!("{}/outbound/ack-%Y%m%d-%H%M%S.dat", tmp.path().display()),
        Box::new(Recorder(seen.clone())),
    );

    inbox.post(b"").unwrap();
    inbox.post(&[0x7F, 1, 2]).unwrap();
    inbox.post(&[2, 0, 0]).unwrap();
    inbox.post(b"\x00set interval 600").unwrap();

    assert_eq!(d.process_pending(&inbox).unwrap(), 4);
    assert!(inbox.pending().unwrap().is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![b"set interval 600".to_vec()]);
    assert!(acks(tmp.path()).is_empty());
}
