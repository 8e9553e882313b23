use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

pub fn strbool(value: &str) -> bool {
    ["true", "True", "t", "T", "1"].contains(&value)
}

pub fn md5_file(file_path: &Path) -> io::Result<[u8; 16]> {
    let f = File::open(file_path)?;
    let len = f.metadata()?.len();
    let buf_len = (len.min(1_000_000) as usize).max(1);
    let mut buf = BufReader::with_capacity(buf_len, f);
    let mut context = md5::Context::new();
    loop {
        let part = buf.fill_buf()?;
        if part.is_empty() {
            break;
        }
        context.consume(part);
        let part_len = part.len();
        buf.consume(part_len);
    }
    Ok(context.compute().0)
}

/// True when `local_hash` equals a non empty `server_hash`
pub fn same_hash(server_hash: Option<&[u8]>, local_hash: &[u8]) -> bool {
    match server_hash {
        Some(server_hash) => !server_hash.is_empty() && server_hash == local_hash,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_md5_file() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(md5_file(&path).unwrap(), md5::compute(b"hello").0);
        assert!(md5_file(&folder.path().join("missing")).is_err());
    }

    #[test]
    fn test_same_hash() {
        assert!(same_hash(Some(&[1, 2]), &[1, 2]));
        assert!(!same_hash(Some(&[]), &[]));
        assert!(!same_hash(None, &[1]));
        assert!(!same_hash(Some(&[1]), &[2]));
    }
}
