/// Packet capture replay.
///
/// A capture is a plain concatenation of update packets exactly as they go on
/// the wire. Each starts with its big-endian length field, which counts the
/// bytes after itself, so the file can be split without decoding anything.
///
/// Design choices:
/// - Memory-mapped file I/O via `memmap2`, the OS handles paging.
/// - Packets are yielded as borrowed slices into the map; nothing is copied
///   until the caller hands a packet to the pipeline.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use tracing::warn;

use crate::wire;

/// Largest body the codec can describe: subject id, count and 65535 updates.
pub const MAX_PACKET_BODY: usize = 6 + wire::UPDATE_LEN * u16::MAX as usize;

/// Memory-mapped capture reader.
pub struct CaptureReader {
    mmap: Mmap,
}

impl CaptureReader {
    /// Open and memory-map a capture file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        // The map is read-only and the capture is not modified while replaying.
        let mmap = unsafe { Mmap::map(&file)? };
        #[cfg(unix)]
        {
            let _ = mmap.advise(memmap2::Advice::Sequential);
        }
        Ok(Self { mmap })
    }

    /// Iterate over the packets in file order.
    pub fn packets(&self) -> Packets<'_> {
        Packets::new(&self.mmap[..])
    }

    pub fn len_bytes(&self) -> usize {
        self.mmap.len()
    }
}

/// Splits a byte buffer into length-prefixed packets.
///
/// A zero length field is skipped and counted. An oversized length or a
/// truncated tail ends the scan, since nothing after it can be framed.
pub struct Packets<'a> {
    data: &'a [u8],
    pos: usize,
    invalid: u64,
}

impl<'a> Packets<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, invalid: 0 }
    }

    /// Bad length fields seen so far.
    pub fn invalid(&self) -> u64 {
        self.invalid
    }

    fn give_up(&mut self) -> Option<&'a [u8]> {
        self.invalid += 1;
        self.pos = self.data.len();
        None
    }
}

impl<'a> Iterator for Packets<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let rest = &self.data[self.pos..];
            if rest.is_empty() {
                return None;
            }
            if rest.len() < 4 {
                warn!(offset = self.pos, "capture ends inside a length field");
                return self.give_up();
            }
            let body = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if body == 0 {
                warn!(offset = self.pos, "zero packet length in capture, skipped");
                self.invalid += 1;
                self.pos += 4;
                continue;
            }
            if body > MAX_PACKET_BODY {
                warn!(offset = self.pos, body, "oversized packet length in capture");
                return self.give_up();
            }
            if rest.len() < 4 + body {
                warn!(offset = self.pos, body, "capture truncated mid-packet");
                return self.give_up();
            }
            let packet = &rest[..4 + body];
            self.pos += 4 + body;
            return Some(packet);
        }
    }
}

/// Write packets back to back into a capture file.
pub fn write_capture<'a, P, I>(path: P, packets: I) -> io::Result<usize>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = BufWriter::new(File::create(path)?);
    let mut n = 0;
    for p in packets {
        out.write_all(p)?;
        n += 1;
    }
    out.flush()?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use crate::wire;

    fn packet(subject_id: u32, n: u8) -> Vec<u8> {
        let updates = (0..n)
            .map(|i| LevelUpdate { level: i, side: Side::Supply, value: i as i64, volume: 1 })
            .collect();
        wire::encode_update(&UpdateMessage { subject_id, updates }).unwrap()
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input_packets.bin");
        let written = vec![packet(10001, 1), packet(10002, 3), packet(10001, 2)];
        write_capture(&path, written.iter().map(|p| p.as_slice())).unwrap();

        let reader = CaptureReader::open(&path).unwrap();
        let read: Vec<_> = reader.packets().map(|p| p.to_vec()).collect();
        assert_eq!(read, written);
        assert_eq!(wire::decode(&read[1]).unwrap().updates.len(), 3);
    }

    #[test]
    fn test_stops_on_truncated_tail() {
        let mut data = packet(1, 1);
        let second = packet(2, 2);
        data.extend_from_slice(&second[..second.len() - 3]);
        let mut packets = Packets::new(&data);
        assert_eq!(packets.by_ref().count(), 1);
        assert_eq!(packets.invalid(), 1);
    }

    #[test]
    fn test_zero_length_is_skipped() {
        let mut data = packet(1, 1);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&packet(2, 1));
        let mut packets = Packets::new(&data);
        let subjects: Vec<_> = packets.by_ref().filter_map(wire::peek_subject).collect();
        assert_eq!(subjects, vec![1, 2]);
        assert_eq!(packets.invalid(), 1);
    }

    #[test]
    fn test_large_packets_are_replayed() {
        let big = wire::encode_update(&UpdateMessage {
            subject_id: 7,
            updates: vec![
                LevelUpdate { level: 0, side: Side::Demand, value: 1, volume: 1 };
                300
            ],
        })
        .unwrap();
        let mut data = big.clone();
        data.extend_from_slice(&packet(8, 0));

        let read: Vec<_> = Packets::new(&data).collect();
        assert_eq!(read.len(), 2);
        assert_eq!(wire::decode(read[0]).unwrap().updates.len(), 300);
        assert_eq!(wire::peek_subject(read[1]), Some(8));
    }

    #[test]
    fn test_stops_on_oversized_length() {
        let mut data = packet(1, 1);
        data.extend_from_slice(&((MAX_PACKET_BODY + 1) as u32).to_be_bytes());
        data.extend_from_slice(&packet(2, 1));
        let mut packets = Packets::new(&data);
        assert_eq!(packets.by_ref().count(), 1);
        assert_eq!(packets.invalid(), 1);
    }

    #[test]
    fn test_empty_capture() {
        assert_eq!(Packets::new(&[]).count(), 0);
    }
}
