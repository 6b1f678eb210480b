//! In-memory tar packing for uploads.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// Pack `contents` as a single file entry named `name`.
pub(super) fn pack_file(name: &str, contents: &[u8]) -> io::Result<Vec<u8>> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}
