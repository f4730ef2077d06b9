//! Binary dump/restore of L1 + L2. Integer widths and byte order are fixed
//! and explicit, little-endian throughout.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::cache::{ExactCache, VectorIndex};
use crate::error::{Result, VecsError};

const MAGIC: &[u8; 6] = b"VECS01";
const SECTION_L1: u8 = 0x01;
const SECTION_L2: u8 = 0x02;

/// Writes the magic, then the L1 section, then the L2 section. Expired
/// entries in either tier are dropped silently.
pub fn save(path: &Path, l1: &ExactCache, l2: &VectorIndex) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    save_l1(&mut w, l1)?;
    save_l2(&mut w, l2)?;
    w.flush()?;
    info!(path = %path.display(), l1 = l1.len(), l2 = l2.len(), "snapshot saved");
    Ok(())
}

fn save_l1<W: Write>(w: &mut W, l1: &ExactCache) -> Result<()> {
    w.write_all(&[SECTION_L1])?;
    for (key, val, expires_at) in l1.iter_live() {
        write_u32(w, key.len() as u32)?;
        w.write_all(key.as_bytes())?;
        write_u32(w, val.len() as u32)?;
        w.write_all(val.as_bytes())?;
        write_i64(w, to_unix_secs(expires_at))?;
    }
    write_u32(w, 0) // terminator: key_len == 0
}

fn save_l2<W: Write>(w: &mut W, l2: &VectorIndex) -> Result<()> {
    w.write_all(&[SECTION_L2])?;
    write_u32(w, l2.dim() as u32)?;
    for (vector, prompt, resp, expires_at) in l2.iter_live() {
        w.write_all(&[1u8])?;
        for f in vector {
            w.write_all(&f.to_le_bytes())?;
        }
        write_u32(w, prompt.len() as u32)?;
        w.write_all(prompt.as_bytes())?;
        write_u32(w, resp.len() as u32)?;
        w.write_all(resp.as_bytes())?;
        write_i64(w, to_unix_secs(expires_at))?;
    }
    w.write_all(&[0u8]) // terminator: valid == 0
        .map_err(VecsError::from)
}

/// Loads a snapshot from `path` into `l1`/`l2`. A missing file, magic
/// mismatch, or dimension mismatch is logged and treated as a non-fatal
/// "start empty".
pub fn load(path: &Path, l1: &mut ExactCache, l2: &mut VectorIndex) -> Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot file, starting empty");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 6];
    if r.read_exact(&mut magic).is_err() || &magic != MAGIC {
        warn!(path = %path.display(), "snapshot magic mismatch, starting empty");
        return Ok(());
    }

    if let Err(e) = load_l1(&mut r, l1) {
        warn!(path = %path.display(), error = %e, "L1 snapshot section corrupt, starting empty");
        l1.clear();
        return Ok(());
    }
    if let Err(e) = load_l2(&mut r, l2) {
        warn!(path = %path.display(), error = %e, "L2 snapshot section corrupt, starting empty");
        l2.clear();
        return Ok(());
    }
    info!(path = %path.display(), l1 = l1.len(), l2 = l2.len(), "snapshot loaded");
    Ok(())
}

fn load_l1<R: Read>(r: &mut R, l1: &mut ExactCache) -> Result<()> {
    let section_id = read_u8(r)?;
    if section_id != SECTION_L1 {
        return Err(VecsError::SnapshotCorrupt { detail: "expected L1 section id".into() });
    }
    loop {
        let key_len = read_u32(r)?;
        if key_len == 0 {
            return Ok(());
        }
        let key = read_string(r, key_len as usize)?;
        let val_len = read_u32(r)?;
        let val = read_string(r, val_len as usize)?;
        let expire_at = read_i64(r)?;
        l1.restore(key, val, from_unix_secs(expire_at));
    }
}

fn load_l2<R: Read>(r: &mut R, l2: &mut VectorIndex) -> Result<()> {
    let section_id = read_u8(r)?;
    if section_id != SECTION_L2 {
        return Err(VecsError::SnapshotCorrupt { detail: "expected L2 section id".into() });
    }
    let dim_check = read_u32(r)? as usize;
    if dim_check != l2.dim() {
        return Err(VecsError::SnapshotCorrupt {
            detail: format!("dimension mismatch: file has {dim_check}, runtime has {}", l2.dim()),
        });
    }
    loop {
        let valid = read_u8(r)?;
        if valid == 0 {
            return Ok(());
        }
        let mut vector = vec![0.0f32; dim_check];
        for slot in &mut vector {
            let mut bytes = [0u8; 4];
            r.read_exact(&mut bytes)?;
            *slot = f32::from_le_bytes(bytes);
        }
        let prompt_len = read_u32(r)?;
        let prompt = read_string(r, prompt_len as usize)?;
        let resp_len = read_u32(r)?;
        let resp = read_string(r, resp_len as usize)?;
        let expire_at = read_i64(r)?;
        // Reinserts through the normal path, so centroids retrain on load.
        l2.restore(&vector, &prompt, &resp, from_unix_secs(expire_at));
    }
}

fn to_unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn from_unix_secs(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(VecsError::from)
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(VecsError::from)
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

fn read_string<R: Read>(r: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| VecsError::SnapshotCorrupt { detail: "non-utf8 string".into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn save_then_load_round_trips_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.vecs");

        let mut l1 = ExactCache::new();
        l1.set("hello|{}".into(), "world".into(), Duration::from_secs(3600));
        let mut l2 = VectorIndex::new(4, 100);
        l2.insert(&[1.0, 0.0, 0.0, 0.0], "hello", "world", Duration::from_secs(3600)).unwrap();

        save(&path, &l1, &l2).unwrap();

        let mut l1_restored = ExactCache::new();
        let mut l2_restored = VectorIndex::new(4, 100);
        load(&path, &mut l1_restored, &mut l2_restored).unwrap();

        assert_eq!(l1_restored.get("hello|{}"), Some("world"));
        assert_eq!(l2_restored.len(), 1);
    }

    #[test]
    fn load_missing_file_starts_empty_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.vecs");
        let mut l1 = ExactCache::new();
        let mut l2 = VectorIndex::new(4, 100);
        assert!(load(&path, &mut l1, &mut l2).is_ok());
        assert!(l1.is_empty());
    }

    #[test]
    fn load_bad_magic_starts_empty_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.vecs");
        std::fs::write(&path, b"NOTVECS_garbage").unwrap();
        let mut l1 = ExactCache::new();
        let mut l2 = VectorIndex::new(4, 100);
        assert!(load(&path, &mut l1, &mut l2).is_ok());
        assert!(l1.is_empty());
        assert!(l2.is_empty());
    }

    #[test]
    fn load_dimension_mismatch_starts_l2_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dim.vecs");
        let l1 = ExactCache::new();
        let l2 = VectorIndex::new(4, 100);
        save(&path, &l1, &l2).unwrap();

        let mut l1_restored = ExactCache::new();
        let mut l2_restored = VectorIndex::new(8, 100);
        assert!(load(&path, &mut l1_restored, &mut l2_restored).is_ok());
        assert!(l2_restored.is_empty());
    }

    #[test]
    fn expired_entries_are_dropped_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ttl.vecs");
        let mut l1 = ExactCache::new();
        l1.set("k".into(), "v".into(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        let l2 = VectorIndex::new(4, 100);

        save(&path, &l1, &l2).unwrap();

        let mut l1_restored = ExactCache::new();
        let mut l2_restored = VectorIndex::new(4, 100);
        load(&path, &mut l1_restored, &mut l2_restored).unwrap();
        assert!(l1_restored.is_empty());
    }
}
