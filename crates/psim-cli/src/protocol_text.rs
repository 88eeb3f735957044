//! Reader for the protocol text format: one task per line, task ids written
//! as zero-padded `[ddddd]` tokens.
//!
//! Grounded in `original_source/src/protocol_builder.cc`'s
//! `load_protocol_from_file`. Lives here, not in `psim-protocol`, because the
//! core crates only ever consume an in-memory `Protocol` -- this text format
//! is an external tool's output, not a format the simulator itself needs to
//! know about.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use psim_protocol::{Protocol, TaskKind};

/// Maps a raw device id through an optional shuffle table
/// (`original_source/src/context.cc: GContext::get_device_shuffle_map`).
fn shuffle(dev: u64, map: Option<&HashMap<u64, u64>>) -> u64 {
    match map {
        Some(m) => m.get(&dev).copied().unwrap_or(dev),
        None => dev,
    }
}

/// Reads a shuffle map file: one integer per line, line number is the
/// original device id, the integer is the id it maps to.
pub fn load_shuffle_map(path: &Path) -> anyhow::Result<HashMap<u64, u64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading shuffle map file {}", path.display()))?;
    let mut map = HashMap::new();
    for (i, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mapped: u64 = line
            .parse()
            .with_context(|| format!("shuffle map file {} line {}: not an integer", path.display(), i + 1))?;
        map.insert(i as u64, mapped);
    }
    Ok(map)
}

fn bracketed_id(token: &str, line_no: usize) -> anyhow::Result<u64> {
    let inner = token
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .with_context(|| format!("protocol file line {line_no}: expected a bracketed id, got '{token}'"))?;
    inner
        .parse()
        .with_context(|| format!("protocol file line {line_no}: '{token}' is not a valid id"))
}

/// Parses one protocol text file into a [`Protocol`]. The protocol's job id
/// is left at zero; the caller (via `Simulator::add_protocol`) assigns the
/// real one on registration.
pub fn load_protocol(path: &Path, shuffle_map: Option<&HashMap<u64, u64>>) -> anyhow::Result<Protocol> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading protocol file {}", path.display()))?;
    let mut protocol = Protocol::new(0);

    for (idx, raw_line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let tokens: Vec<&str> = raw_line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let kind = match tokens[0] {
            "AllR" => LineKind::Empty,
            "Comm" => LineKind::Flow,
            "Forw" | "Back" => LineKind::Compute,
            other => {
                tracing::warn!(line_no, task_type = other, "skipping unrecognized protocol line type");
                continue;
            }
        };

        if tokens.len() < 3 || tokens[2] != "next" {
            bail!("protocol file line {line_no}: expected '<TYPE> [id] next ...'");
        }
        let task_id = bracketed_id(tokens[1], line_no)?;

        let mut i = 3;
        let mut next_ids = Vec::new();
        while i < tokens.len() && tokens[i].starts_with('[') {
            next_ids.push(bracketed_id(tokens[i], line_no)?);
            i += 1;
        }

        let task_kind = match kind {
            LineKind::Empty => TaskKind::Empty,
            LineKind::Compute => {
                if tokens.len() < i + 4 || tokens[i] != "size" || tokens[i + 2] != "dev" {
                    bail!("protocol file line {line_no}: expected 'size <number> dev <int>' after the next-task list");
                }
                let size: f64 = tokens[i + 1]
                    .parse()
                    .with_context(|| format!("protocol file line {line_no}: invalid size '{}'", tokens[i + 1]))?;
                let dev_id: u64 = tokens[i + 3]
                    .parse()
                    .with_context(|| format!("protocol file line {line_no}: invalid dev id '{}'", tokens[i + 3]))?;
                TaskKind::Compute {
                    dev_id: shuffle(dev_id, shuffle_map),
                    size,
                    progress: 0.0,
                }
            }
            LineKind::Flow => {
                if tokens.len() < i + 6 || tokens[i] != "size" || tokens[i + 2] != "from" || tokens[i + 4] != "to" {
                    bail!("protocol file line {line_no}: expected 'size <number> from <int> to <int>' after the next-task list");
                }
                let size: f64 = tokens[i + 1]
                    .parse()
                    .with_context(|| format!("protocol file line {line_no}: invalid size '{}'", tokens[i + 1]))?;
                let src: u64 = tokens[i + 3]
                    .parse()
                    .with_context(|| format!("protocol file line {line_no}: invalid src id '{}'", tokens[i + 3]))?;
                let dst: u64 = tokens[i + 5]
                    .parse()
                    .with_context(|| format!("protocol file line {line_no}: invalid dst id '{}'", tokens[i + 5]))?;
                TaskKind::Flow {
                    src: shuffle(src, shuffle_map),
                    dst: shuffle(dst, shuffle_map),
                    size,
                    progress: 0.0,
                    current_rate: 0.0,
                    registered_rate: 0.0,
                    min_bottleneck_rate: 0.0,
                    selected_priority: 0,
                    path: Vec::new(),
                    protocol_defined_max_rate: -1.0,
                    bottlenecked_by_srcdst_count: 0,
                    bottlenecked_by_intermediate_count: 0,
                }
            }
        };

        protocol
            .add_task_with_id(task_id, task_kind, next_ids)
            .with_context(|| format!("protocol file line {line_no}"))?;
    }

    Ok(protocol)
}

enum LineKind {
    Empty,
    Flow,
    Compute,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    struct TempFile(PathBuf);

    impl TempFile {
        fn with_contents(contents: &str) -> Self {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!("psim-cli-test-{}-{n}.txt", std::process::id()));
            std::fs::write(&path, contents).unwrap();
            TempFile(path)
        }
    }

    impl AsRef<Path> for TempFile {
        fn as_ref(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn write_tmp(contents: &str) -> TempFile {
        TempFile::with_contents(contents)
    }

    #[test]
    fn parses_compute_flow_and_empty_lines() {
        let contents = "Forw [00000] next [00001] size 10 dev 0\n\
                         Comm [00001] next [00002] size 1000 from 0 to 1\n\
                         AllR [00002] next size 0 dev 0\n\
                         Junk [00003] next size 0 dev 0\n";
        let file = write_tmp(contents);
        let protocol = load_protocol(file.as_ref(), None).unwrap();
        assert_eq!(protocol.total_count(), 3);
        match &protocol.task(0).unwrap().kind {
            TaskKind::Compute { dev_id, size, .. } => {
                assert_eq!(*dev_id, 0);
                assert_eq!(*size, 10.0);
            }
            other => panic!("expected compute task, got {other:?}"),
        }
        match &protocol.task(1).unwrap().kind {
            TaskKind::Flow { src, dst, size, .. } => {
                assert_eq!(*src, 0);
                assert_eq!(*dst, 1);
                assert_eq!(*size, 1000.0);
            }
            other => panic!("expected flow task, got {other:?}"),
        }
        assert!(matches!(protocol.task(2).unwrap().kind, TaskKind::Empty));
    }

    #[test]
    fn shuffle_map_remaps_device_ids() {
        let contents = "Forw [00000] next size 10 dev 3\n";
        let file = write_tmp(contents);
        let mut map = HashMap::new();
        map.insert(3, 7);
        let protocol = load_protocol(file.as_ref(), Some(&map)).unwrap();
        match &protocol.task(0).unwrap().kind {
            TaskKind::Compute { dev_id, .. } => assert_eq!(*dev_id, 7),
            other => panic!("expected compute task, got {other:?}"),
        }
    }

    #[test]
    fn malformed_flow_line_is_rejected() {
        let contents = "Comm [00000] next size 1000 from 0\n";
        let file = write_tmp(contents);
        assert!(load_protocol(file.as_ref(), None).is_err());
    }
}
