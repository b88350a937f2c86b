//! In-memory tar archive construction for workspace file uploads.
//!
//! Files handed to `execute_*` as byte buffers are packed into a tar payload
//! and uploaded through the engine API rather than written through the
//! host-side bind mount, so a symlink planted by a previous execution can
//! never redirect a write onto the host filesystem.

use std::collections::BTreeMap;
use std::io;

use tar::{Builder, EntryType, Header};

const DEFAULT_FILE_MODE: u32 = 0o644;

/// Build a tar archive holding the given files at their relative names.
///
/// Names must be relative and must not contain `..` components; entries are
/// written in sorted order so archives are deterministic.
///
/// # Errors
///
/// Returns `io::ErrorKind::InvalidInput` for absolute or traversing names,
/// and any underlying I/O error from the tar builder.
pub(crate) fn build_files_archive(files: &BTreeMap<String, Vec<u8>>) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(vec![]);

    for (name, contents) in files {
        let path = sanitize_entry_name(name)?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(DEFAULT_FILE_MODE);
        header.set_cksum();

        builder.append_data(&mut header, path, contents.as_slice())?;
    }

    builder.finish()?;
    builder.into_inner()
}

fn sanitize_entry_name(name: &str) -> io::Result<&str> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/')
        || normalized.split('/').any(|component| component == "..")
        || normalized.trim().is_empty()
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid workspace file name: {name}"),
        ));
    }
    Ok(name)
}
