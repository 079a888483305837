//! SHA-1 content digests, hex encoded.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::error::{io_err, RemexError};

/// Lower-case hex SHA-1 of `bytes`.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut h = Sha1::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Lower-case hex SHA-1 of the file at `path`, streamed.
pub fn sha1_file(path: &Path) -> Result<String, RemexError> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut h = Sha1::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(io_err(path, err)),
        };
        h.update(&buf[..n]);
    }
    Ok(hex::encode(h.finalize()))
}

/// True if `s` looks like a SHA-1 hex digest (and is safe as a file name).
pub fn is_sha1_hex(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
