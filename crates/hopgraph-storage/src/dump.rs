//! NDJSON data dumps, one `{"collection": .., "doc": {..}}` record per line.
//! Files ending in `.zst` are zstd-compressed.

use crate::mem::InMemoryStore;
use hopgraph_core::Document;
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpRecord {
    pub collection: String,
    pub doc: Document,
}

pub struct DumpWriter {
    out: Box<dyn Write>,
    pub path: PathBuf,
    pub records: usize,
}

impl DumpWriter {
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let fh = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let out: Box<dyn Write> = if is_compressed(&path) {
            Box::new(zstd::Encoder::new(fh, 3)?.auto_finish())
        } else {
            Box::new(fh)
        };
        Ok(Self {
            out,
            path,
            records: 0,
        })
    }

    pub fn write_record(&mut self, rec: &DumpRecord) -> std::io::Result<()> {
        let s = serde_json::to_string(rec)?;
        self.out.write_all(s.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<usize> {
        self.out.flush()?;
        Ok(self.records)
    }
}

/// Reads every well-formed record; malformed lines are skipped with a warning.
pub fn read_dump(path: &Path) -> std::io::Result<Vec<DumpRecord>> {
    let fh = File::open(path)?;
    let reader: Box<dyn Read> = if is_compressed(path) {
        Box::new(zstd::Decoder::new(fh)?)
    } else {
        Box::new(fh)
    };
    let br = BufReader::new(reader);
    let mut out = Vec::new();
    for (n, line) in br.lines().enumerate() {
        let l = line?;
        if l.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DumpRecord>(&l) {
            Ok(rec) => out.push(rec),
            Err(e) => tracing::warn!(line = n + 1, error = %e, "skipping malformed dump record"),
        }
    }
    Ok(out)
}

/// Load a dump into a fresh store. Returns the store and the record count.
pub fn load_store(path: &Path) -> std::io::Result<(InMemoryStore, usize)> {
    let recs = read_dump(path)?;
    let n = recs.len();
    let store = InMemoryStore::new();
    for r in recs {
        store.insert(&r.collection, r.doc);
    }
    Ok((store, n))
}

fn is_compressed(path: &Path) -> bool {
    path.extension().map(|e| e == "zst").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_load_compressed() {
        let dir = std::env::temp_dir().join(format!("hopgraph-dump-{}", std::process::id()));
        let path = dir.join("seed.ndjson.zst");
        let mut w = DumpWriter::create(path.clone()).unwrap();
        for i in 0..3 {
            w.write_record(&DumpRecord {
                collection: "companies".into(),
                doc: Document::from(json!({"_id": i})),
            })
            .unwrap();
        }
        assert_eq!(w.finish().unwrap(), 3);
        let (store, n) = load_store(&path).unwrap();
        assert_eq!(n, 3);
        assert_eq!(store.len("companies"), 3);
        std::fs::remove_dir_all(dir).ok();
    }
}
