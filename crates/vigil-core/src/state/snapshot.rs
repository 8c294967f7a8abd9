//! Best-effort binary snapshot of the per-IP table.
//!
//! File layout (all integers little-endian):
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ magic: u32          = 0xADE57A7E             │
//! │ version: u8         = 1                      │
//! │ entry_count: u32                             │
//! ├──────────────────────────────────────────────┤
//! │ per entry:                                   │
//! │   ip_key: u32                                │
//! │   first_seen_ms: u64, last_seen_ms: u64      │
//! │   threat_flags: u8, activity: [u8; 3]        │
//! │   compaction_count: u16                      │
//! │   4 × stats tracker (count: u32,             │
//! │        sum_fp: u64, sum_sq_fp: u64)          │
//! │   paths_bloom_len: u32 + bytes               │
//! │   uas_bloom_len: u32 + bytes                 │
//! ├──────────────────────────────────────────────┤
//! │ crc32 of everything above: u32               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Sliding windows are not persisted; they rebuild from traffic. Bloom
//! bodies are persisted; the exact confirmation reservoirs restart in
//! overflowed mode so loaded filters are trusted as-is.

use std::io;
use std::path::Path;

use crate::config::Tier1Config;
use crate::state::per_ip::PerIpState;
use crate::state::table::StateTable;
use crate::util::bloom::BloomFilter;
use crate::util::stats::CompactStatsTracker;

pub const SNAPSHOT_MAGIC: u32 = 0xADE5_7A7E;
pub const SNAPSHOT_VERSION: u8 = 1;

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(io::Error::other("truncated snapshot"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

fn encode_tracker(buf: &mut Vec<u8>, tracker: &CompactStatsTracker) {
    let (count, sum_fp, sum_sq_fp) = tracker.to_raw();
    put_u32(buf, count);
    put_u64(buf, sum_fp);
    put_u64(buf, sum_sq_fp);
}

fn decode_tracker(r: &mut Reader) -> io::Result<CompactStatsTracker> {
    let count = r.u32()?;
    let sum_fp = r.u64()?;
    let sum_sq_fp = r.u64()?;
    Ok(CompactStatsTracker::from_raw(count, sum_fp, sum_sq_fp))
}

fn encode_bloom(buf: &mut Vec<u8>, bloom: &BloomFilter<str>) {
    let body = bloom.serialize();
    put_u32(buf, body.len() as u32);
    buf.extend_from_slice(&body);
}

fn decode_bloom(r: &mut Reader) -> io::Result<BloomFilter<str>> {
    let len = r.u32()? as usize;
    let body = r.bytes(len)?;
    BloomFilter::deserialize(body).ok_or_else(|| io::Error::other("corrupt bloom body"))
}

fn encode_entry(buf: &mut Vec<u8>, key: u64, state: &PerIpState) {
    put_u32(buf, key as u32);
    put_u64(buf, state.first_seen_ms);
    put_u64(buf, state.last_seen_ms);
    buf.push(state.threat_flags);
    buf.extend_from_slice(&state.activity_pattern);
    buf.extend_from_slice(&state.compaction_count.to_le_bytes());
    encode_tracker(buf, &state.request_time);
    encode_tracker(buf, &state.bytes_sent);
    encode_tracker(buf, &state.error_rate);
    encode_tracker(buf, &state.request_volume);
    encode_bloom(buf, state.paths_seen.bloom());
    encode_bloom(buf, state.uas_seen.bloom());
}

fn decode_entry(r: &mut Reader, cfg: &Tier1Config) -> io::Result<(u64, PerIpState)> {
    let key = r.u32()? as u64;
    let first_seen_ms = r.u64()?;
    let last_seen_ms = r.u64()?;
    let threat_flags = r.u8()?;
    let activity: [u8; 3] = r.bytes(3)?.try_into().unwrap();
    let compaction_count = r.u16()?;
    let request_time = decode_tracker(r)?;
    let bytes_sent = decode_tracker(r)?;
    let error_rate = decode_tracker(r)?;
    let request_volume = decode_tracker(r)?;
    let paths_bloom = decode_bloom(r)?;
    let uas_bloom = decode_bloom(r)?;

    let mut state = PerIpState::new(first_seen_ms, cfg);
    state.first_seen_ms = first_seen_ms;
    state.last_seen_ms = last_seen_ms;
    state.threat_flags = threat_flags;
    state.activity_pattern = activity;
    state.compaction_count = compaction_count;
    state.request_time = request_time;
    state.bytes_sent = bytes_sent;
    state.error_rate = error_rate;
    state.request_volume = request_volume;
    state.paths_seen = crate::state::per_ip::ApproxStringSet::from_bloom(paths_bloom);
    state.uas_seen = crate::state::per_ip::ApproxStringSet::from_bloom(uas_bloom);
    Ok((key, state))
}

/// Serialize the live entries of the per-IP table.
pub fn encode_table(table: &StateTable<PerIpState>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + table.len() * 256);
    put_u32(&mut buf, SNAPSHOT_MAGIC);
    buf.push(SNAPSHOT_VERSION);

    let count_pos = buf.len();
    put_u32(&mut buf, 0);
    let mut count: u32 = 0;
    table.for_each(|key, state| {
        encode_entry(&mut buf, key, state);
        count += 1;
    });
    buf[count_pos..count_pos + 4].copy_from_slice(&count.to_le_bytes());

    let crc = crc32fast::hash(&buf);
    put_u32(&mut buf, crc);
    buf
}

/// Decode a snapshot into `(key, state)` pairs. Rejects bad magic,
/// unknown versions, truncation and checksum mismatches.
pub fn decode_table(data: &[u8], cfg: &Tier1Config) -> io::Result<Vec<(u64, PerIpState)>> {
    if data.len() < 13 {
        return Err(io::Error::other("snapshot too small"));
    }
    let body = &data[..data.len() - 4];
    let stored_crc = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
    if crc32fast::hash(body) != stored_crc {
        return Err(io::Error::other("snapshot checksum mismatch"));
    }

    let mut r = Reader::new(body);
    let magic = r.u32()?;
    if magic != SNAPSHOT_MAGIC {
        return Err(io::Error::other(format!("bad snapshot magic {magic:#x}")));
    }
    let version = r.u8()?;
    if version != SNAPSHOT_VERSION {
        return Err(io::Error::other(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let count = r.u32()?;

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(decode_entry(&mut r, cfg)?);
    }
    Ok(entries)
}

/// Write a snapshot atomically (tmp file + rename).
pub fn save(path: &Path, table: &StateTable<PerIpState>) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, encode_table(table))?;
    std::fs::rename(&tmp, path)
}

/// Load snapshot entries from a file.
pub fn load(path: &Path, cfg: &Tier1Config) -> io::Result<Vec<(u64, PerIpState)>> {
    let data = std::fs::read(path)?;
    decode_table(&data, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PressureLevel;

    fn sample_table(cfg: &Tier1Config) -> StateTable<PerIpState> {
        let mut table = StateTable::new(1_000);
        for key in [0x0102_0304u64, 0x0a00_0001] {
            let state = table
                .get_or_create(key, 1_000, PressureLevel::Normal, |now| {
                    PerIpState::new(now, cfg)
                })
                .unwrap();
            state.touch(5_000);
            state.set_threat_flag(crate::state::per_ip::threat_flags::SCRAPER);
            state.mark_activity_hour(13 * 3_600_000);
            state.record_request_stats(Some(0.25), 4_096, true, 3);
            state.paths_seen.insert("/admin");
            state.uas_seen.insert("curl/8.0");
        }
        table
    }

    #[test]
    fn test_roundtrip_reproduces_persisted_fields() {
        let cfg = Tier1Config::default();
        let table = sample_table(&cfg);
        let bytes = encode_table(&table);
        let entries = decode_table(&bytes, &cfg).unwrap();
        assert_eq!(entries.len(), 2);

        let (_, state) = entries
            .iter()
            .find(|(k, _)| *k == 0x0102_0304)
            .expect("entry for 1.2.3.4");
        assert_eq!(state.first_seen_ms, 1_000);
        assert_eq!(state.last_seen_ms, 5_000);
        assert!(state.has_threat_flag(crate::state::per_ip::threat_flags::SCRAPER));
        assert!(state.is_active_hour(13));
        assert_eq!(state.bytes_sent.count(), 1);
        // Byte trackers hold KB.
        assert!((state.bytes_sent.sum() - 4.0).abs() < 1e-6);
        assert_eq!(state.error_rate.count(), 1);
        assert!(state.paths_seen.contains("/admin"));
        assert!(state.uas_seen.contains("curl/8.0"));
        // Windows rebuild from traffic.
        assert_eq!(state.requests.len(), 0);
    }

    #[test]
    fn test_rejects_corruption() {
        let cfg = Tier1Config::default();
        let table = sample_table(&cfg);
        let mut bytes = encode_table(&table);
        bytes[20] ^= 0xff;
        assert!(decode_table(&bytes, &cfg).is_err());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let cfg = Tier1Config::default();
        let mut bytes = encode_table(&sample_table(&cfg));
        bytes[0] ^= 0xff;
        // Fix up the crc so only the magic is wrong.
        let crc = crc32fast::hash(&bytes[..bytes.len() - 4]);
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&crc.to_le_bytes());
        let err = decode_table(&bytes, &cfg).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_save_and_load() {
        let cfg = Tier1Config::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/engine_state.dat");
        let table = sample_table(&cfg);
        save(&path, &table).unwrap();
        let entries = load(&path, &cfg).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
