//! One bupindex record: a path and the stat signature it had when indexed
//!
//! On disk a record is the basename, a NUL, then a fixed 138-byte
//! big-endian struct. Full names live only in memory and are rebuilt by
//! the reader from the directory links.

use byteorder::{BigEndian, ByteOrder};
use cairn_core::oid::OID_LEN;
use cairn_core::tree::{MODE_EXEC, MODE_FILE, MODE_SYMLINK, MODE_TREE};
use cairn_core::Oid;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const INDEX_HEADER: &[u8; 8] = b"BUPI\0\0\0\x05";
pub const HEADER_LEN: usize = INDEX_HEADER.len();
pub const ENTRY_LEN: usize = 138;
pub const FOOTER_LEN: usize = 8;

pub const IX_EXISTS: u16 = 0x8000;
pub const IX_HASHVALID: u16 = 0x4000;
pub const IX_SHAMISSING: u16 = 0x2000;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

// field offsets within the packed struct
const OFS_CTIME: usize = 24;
const OFS_MTIME: usize = 40;
const OFS_ATIME: usize = 56;
const OFS_SHA: usize = 96;
pub(crate) const OFS_CHILDREN: usize = 118;
pub(crate) const CHILDREN_LEN: usize = 12;

/// Seconds and nanoseconds since the epoch, stored as `q` + `Q`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u64,
}

impl Timestamp {
    pub const fn new(sec: i64, nsec: u64) -> Self {
        Self { sec, nsec }
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos() as u64),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Self::new(-(d.as_secs() as i64), 0)
                } else {
                    Self::new(-(d.as_secs() as i64) - 1, (1_000_000_000 - d.subsec_nanos()) as u64)
                }
            }
        }
    }

    /// The cut-off for an update starting now: anything changed at or
    /// after it may still be changing within timestamp granularity
    pub fn update_start() -> Self {
        let now = SystemTime::now();
        Self::from_system_time(now.checked_sub(Duration::from_secs(1)).unwrap_or(UNIX_EPOCH))
    }
}

/// The parts of `lstat` the index tracks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatInfo {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub atime: Timestamp,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mode: u32,
}

impl StatInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

impl From<&Metadata> for StatInfo {
    fn from(m: &Metadata) -> Self {
        Self {
            dev: m.dev(),
            ino: m.ino(),
            nlink: m.nlink(),
            ctime: Timestamp::new(m.ctime(), m.ctime_nsec() as u64),
            mtime: Timestamp::new(m.mtime(), m.mtime_nsec() as u64),
            atime: Timestamp::new(m.atime(), m.atime_nsec() as u64),
            uid: m.uid(),
            gid: m.gid(),
            size: m.size(),
            mode: m.mode(),
        }
    }
}

/// Git tree mode for a stat mode
pub fn gitmode_for(mode: u32) -> u32 {
    match mode & S_IFMT {
        S_IFDIR => MODE_TREE,
        S_IFLNK => MODE_SYMLINK,
        _ if mode & 0o111 != 0 => MODE_EXEC,
        _ => MODE_FILE,
    }
}

/// Split a path into hierarchy elements, keeping each element's trailing
/// slash: `/a/b/c` becomes `["/", "a/", "b/", "c"]`
pub fn pathsplit(name: &[u8]) -> Vec<Vec<u8>> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, &b) in name.iter().enumerate() {
        if b == b'/' {
            parts.push(name[start..=i].to_vec());
            start = i + 1;
        }
    }
    if start < name.len() {
        parts.push(name[start..].to_vec());
    }
    parts
}

pub(crate) fn basename(name: &[u8]) -> &[u8] {
    let body = name.strip_suffix(b"/").unwrap_or(name);
    match body.iter().rposition(|&b| b == b'/') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    /// Full path; directories end with `/`
    pub name: Vec<u8>,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub atime: Timestamp,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mode: u32,
    pub gitmode: u32,
    pub sha: Oid,
    pub flags: u16,
    pub children_ofs: u64,
    pub children_n: u32,
    pub meta_ofs: u64,
    /// Offset of the packed struct inside the file it was read from
    pub(crate) location: Option<usize>,
}

impl Entry {
    /// A record with no stat data, used for directories the writer
    /// has to synthesize
    pub(crate) fn blank(name: Vec<u8>, meta_ofs: u64) -> Self {
        Self {
            name,
            dev: 0,
            ino: 0,
            nlink: 0,
            ctime: Timestamp::default(),
            mtime: Timestamp::default(),
            atime: Timestamp::default(),
            uid: 0,
            gid: 0,
            size: 0,
            mode: 0,
            gitmode: 0,
            sha: Oid::EMPTY,
            flags: 0,
            children_ofs: 0,
            children_n: 0,
            meta_ofs,
            location: None,
        }
    }

    pub(crate) fn from_stat(name: Vec<u8>, st: &StatInfo, meta_ofs: u64, tmax: Timestamp) -> Self {
        let mut e = Self::blank(name, meta_ofs);
        e.update_from_stat(st, meta_ofs, tmax);
        e
    }

    pub fn basename(&self) -> &[u8] {
        basename(&self.name)
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn exists(&self) -> bool {
        self.flags & IX_EXISTS != 0
    }

    pub fn is_valid(&self) -> bool {
        self.flags & IX_HASHVALID != 0
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with(b"/")
    }

    pub fn is_fake(&self) -> bool {
        self.sha == Oid::FAKE
    }

    /// No usable object for this path: never hashed, or hashed to
    /// something the repository turned out not to have
    pub fn sha_missing(&self) -> bool {
        !self.is_valid() || self.flags & IX_SHAMISSING != 0
    }

    pub fn set_sha_missing(&mut self, missing: bool) {
        if missing {
            self.flags |= IX_SHAMISSING;
        } else {
            self.flags &= !IX_SHAMISSING;
        }
    }

    pub fn invalidate(&mut self) {
        self.flags &= !IX_HASHVALID;
    }

    pub fn validate(&mut self, gitmode: u32, sha: Oid) {
        self.gitmode = gitmode;
        self.sha = sha;
        self.flags |= IX_HASHVALID;
        self.flags &= !IX_SHAMISSING;
    }

    pub fn set_deleted(&mut self) {
        if self.exists() {
            self.flags &= !(IX_EXISTS | IX_HASHVALID);
        }
    }

    /// Whether the path's current stat no longer matches this record
    pub fn stale(&self, st: &StatInfo, check_device: bool) -> bool {
        self.size != st.size
            || self.mtime != st.mtime
            || self.sha == Oid::EMPTY
            || self.gitmode == 0
            || self.ctime != st.ctime
            || self.ino != st.ino
            || self.nlink != st.nlink
            || !self.exists()
            || (check_device && self.dev != st.dev)
            || self.uid != st.uid
            || self.gid != st.gid
    }

    /// Changed so close to `tmax` that a later change could share its
    /// timestamp
    pub fn racy(&self, tmax: Timestamp) -> bool {
        self.ctime >= tmax || self.mtime >= tmax
    }

    /// Copy `st` into the record; callers normally `invalidate` next
    pub fn update_from_stat(&mut self, st: &StatInfo, meta_ofs: u64, tmax: Timestamp) {
        self.dev = st.dev;
        self.ino = st.ino;
        self.nlink = st.nlink;
        self.ctime = st.ctime;
        self.mtime = st.mtime;
        self.atime = st.atime;
        self.uid = st.uid;
        self.gid = st.gid;
        self.size = st.size;
        self.mode = st.mode;
        self.flags |= IX_EXISTS;
        self.meta_ofs = meta_ofs;
        self.fixup(tmax);
    }

    // Times past tmax are clamped so the next update sees a mismatch
    fn fixup(&mut self, tmax: Timestamp) {
        if self.racy(tmax) {
            self.invalidate();
        }
        self.ctime = self.ctime.min(tmax);
        self.mtime = self.mtime.min(tmax);
    }

    pub(crate) fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut r = [0u8; ENTRY_LEN];
        BigEndian::write_u64(&mut r[0..8], self.dev);
        BigEndian::write_u64(&mut r[8..16], self.ino);
        BigEndian::write_u64(&mut r[16..24], self.nlink);
        write_time(&mut r[OFS_CTIME..OFS_CTIME + 16], self.ctime);
        write_time(&mut r[OFS_MTIME..OFS_MTIME + 16], self.mtime);
        write_time(&mut r[OFS_ATIME..OFS_ATIME + 16], self.atime);
        BigEndian::write_u32(&mut r[72..76], self.uid);
        BigEndian::write_u32(&mut r[76..80], self.gid);
        BigEndian::write_u64(&mut r[80..88], self.size);
        BigEndian::write_u32(&mut r[88..92], self.mode);
        BigEndian::write_u32(&mut r[92..96], self.gitmode);
        r[OFS_SHA..OFS_SHA + OID_LEN].copy_from_slice(self.sha.as_bytes());
        BigEndian::write_u16(&mut r[116..118], self.flags);
        BigEndian::write_u64(&mut r[118..126], self.children_ofs);
        BigEndian::write_u32(&mut r[126..130], self.children_n);
        BigEndian::write_u64(&mut r[130..138], self.meta_ofs);
        r
    }

    /// `rec` must be exactly `ENTRY_LEN` bytes
    pub(crate) fn decode(name: Vec<u8>, rec: &[u8], location: usize) -> Self {
        let mut sha = [0u8; OID_LEN];
        sha.copy_from_slice(&rec[OFS_SHA..OFS_SHA + OID_LEN]);
        Self {
            name,
            dev: BigEndian::read_u64(&rec[0..8]),
            ino: BigEndian::read_u64(&rec[8..16]),
            nlink: BigEndian::read_u64(&rec[16..24]),
            ctime: read_time(&rec[OFS_CTIME..OFS_CTIME + 16]),
            mtime: read_time(&rec[OFS_MTIME..OFS_MTIME + 16]),
            atime: read_time(&rec[OFS_ATIME..OFS_ATIME + 16]),
            uid: BigEndian::read_u32(&rec[72..76]),
            gid: BigEndian::read_u32(&rec[76..80]),
            size: BigEndian::read_u64(&rec[80..88]),
            mode: BigEndian::read_u32(&rec[88..92]),
            gitmode: BigEndian::read_u32(&rec[92..96]),
            sha: Oid::from_bytes(sha),
            flags: BigEndian::read_u16(&rec[116..118]),
            children_ofs: BigEndian::read_u64(&rec[118..126]),
            children_n: BigEndian::read_u32(&rec[126..130]),
            meta_ofs: BigEndian::read_u64(&rec[130..138]),
            location: Some(location),
        }
    }
}

fn write_time(out: &mut [u8], t: Timestamp) {
    BigEndian::write_i64(&mut out[0..8], t.sec);
    BigEndian::write_u64(&mut out[8..16], t.nsec);
}

fn read_time(raw: &[u8]) -> Timestamp {
    Timestamp::new(BigEndian::read_i64(&raw[0..8]), BigEndian::read_u64(&raw[8..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(size: u64, mtime: i64) -> StatInfo {
        StatInfo {
            dev: 3,
            ino: 77,
            nlink: 1,
            ctime: Timestamp::new(mtime, 5),
            mtime: Timestamp::new(mtime, 5),
            atime: Timestamp::new(mtime, 9),
            uid: 1000,
            gid: 100,
            size,
            mode: 0o100644,
        }
    }

    const LATER: Timestamp = Timestamp::new(2_000_000_000, 0);

    fn hashed(st: &StatInfo) -> Entry {
        let mut e = Entry::from_stat(b"/d/file".to_vec(), st, 0, LATER);
        e.validate(MODE_FILE, Oid::FAKE);
        e
    }

    #[test]
    fn test_pathsplit() {
        assert_eq!(pathsplit(b"/a/b/c"), vec![b"/".to_vec(), b"a/".to_vec(), b"b/".to_vec(), b"c".to_vec()]);
        assert_eq!(pathsplit(b"/a/b/"), vec![b"/".to_vec(), b"a/".to_vec(), b"b/".to_vec()]);
        assert_eq!(pathsplit(b"/"), vec![b"/".to_vec()]);
        assert!(pathsplit(b"").is_empty());
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename(b"/a/b/c"), b"c");
        assert_eq!(basename(b"/a/b/"), b"b/");
        assert_eq!(basename(b"/"), b"/");
        assert_eq!(basename(b"x/"), b"x/");
    }

    #[test]
    fn test_record_layout() {
        let st = stat(4096, 1_600_000_000);
        let mut e = hashed(&st);
        e.children_ofs = 0x0102_0304;
        e.children_n = 7;
        e.meta_ofs = 99;
        let raw = e.encode();
        assert_eq!(raw.len(), ENTRY_LEN);
        assert_eq!(&raw[OFS_SHA..OFS_SHA + OID_LEN], Oid::FAKE.as_bytes());
        assert_eq!(BigEndian::read_u16(&raw[116..118]), IX_EXISTS | IX_HASHVALID);

        let back = Entry::decode(e.name.clone(), &raw, 8);
        assert_eq!(back.mtime, st.mtime);
        assert_eq!(back.atime, st.atime);
        assert_eq!((back.uid, back.gid, back.size), (1000, 100, 4096));
        assert_eq!((back.children_ofs, back.children_n, back.meta_ofs), (0x0102_0304, 7, 99));
        assert_eq!(back.location, Some(8));
    }

    #[test]
    fn test_negative_times_survive_encoding() {
        let mut st = stat(1, 0);
        st.mtime = Timestamp::from_system_time(UNIX_EPOCH - Duration::from_millis(1500));
        assert_eq!(st.mtime, Timestamp::new(-2, 500_000_000));
        let e = Entry::from_stat(b"/old".to_vec(), &st, 0, LATER);
        assert_eq!(Entry::decode(e.name.clone(), &e.encode(), 0).mtime, st.mtime);
    }

    #[test]
    fn test_fresh_entry_is_fresh() {
        let st = stat(10, 1_600_000_000);
        assert!(!hashed(&st).stale(&st, true));
    }

    #[test]
    fn test_stale_on_signature_change() {
        let st = stat(10, 1_600_000_000);
        let e = hashed(&st);
        for changed in [
            StatInfo { size: 11, ..st },
            StatInfo { mtime: Timestamp::new(1_600_000_001, 5), ..st },
            StatInfo { ctime: Timestamp::new(1_600_000_000, 6), ..st },
            StatInfo { ino: 78, ..st },
            StatInfo { nlink: 2, ..st },
            StatInfo { uid: 0, ..st },
            StatInfo { gid: 0, ..st },
        ] {
            assert!(e.stale(&changed, true), "{changed:?}");
        }
    }

    #[test]
    fn test_device_check_is_optional() {
        let st = stat(10, 1_600_000_000);
        let e = hashed(&st);
        let moved = StatInfo { dev: 4, ..st };
        assert!(e.stale(&moved, true));
        assert!(!e.stale(&moved, false));
    }

    #[test]
    fn test_unhashed_or_deleted_is_stale() {
        let st = stat(10, 1_600_000_000);
        assert!(Entry::from_stat(b"/f".to_vec(), &st, 0, LATER).stale(&st, true));

        let mut e = hashed(&st);
        e.gitmode = 0;
        assert!(e.stale(&st, true));

        let mut e = hashed(&st);
        e.set_deleted();
        assert!(!e.exists());
        assert!(!e.is_valid());
        assert!(e.stale(&st, true));
    }

    #[test]
    fn test_recent_change_is_clamped_and_invalid() {
        let tmax = Timestamp::new(1_600_000_000, 0);
        let st = stat(10, 1_600_000_050);
        let mut e = Entry::from_stat(b"/f".to_vec(), &st, 0, tmax);
        e.validate(MODE_FILE, Oid::FAKE);
        e.update_from_stat(&st, 0, tmax);
        assert!(!e.is_valid());
        assert_eq!(e.mtime, tmax);
        assert_eq!(e.ctime, tmax);
        // the clamped time never matches the real one
        assert!(e.stale(&st, true));
    }

    #[test]
    fn test_sha_missing() {
        let st = stat(10, 1_600_000_000);
        let mut e = hashed(&st);
        assert!(!e.sha_missing());
        e.set_sha_missing(true);
        assert!(e.sha_missing());
        e.validate(MODE_FILE, Oid::FAKE);
        assert!(!e.sha_missing());
        e.invalidate();
        assert!(e.sha_missing());
    }

    #[test]
    fn test_gitmode_for() {
        assert_eq!(gitmode_for(0o040755), MODE_TREE);
        assert_eq!(gitmode_for(0o120777), MODE_SYMLINK);
        assert_eq!(gitmode_for(0o100755), MODE_EXEC);
        assert_eq!(gitmode_for(0o100600), MODE_FILE);
    }
}
