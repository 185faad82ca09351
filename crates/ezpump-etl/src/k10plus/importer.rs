//! Streaming importer writing `k10plus_data` rows

use super::line::{group_line, parse_line, Line};
use super::{CancelFlag, ResumeToken};
use crate::error::{EtlError, Result};
use crate::intermediate::IntermediateStore;
use crate::repository::{Repository, Transaction};
use crate::value::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Items per transaction
pub const DEFAULT_COMMIT_EVERY: usize = 1000;

const PROGRESS_EVERY: i64 = 1000;

/// Result of one run over one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Checkpoint after the run; pass it to the next run of the same file
    pub token: ResumeToken,
    /// Items committed in this run
    pub items: usize,
    /// Data rows committed in this run
    pub rows: usize,
    /// Items skipped because an earlier run committed them
    pub skipped: usize,
    /// The run stopped early (cancel flag or line limit)
    pub interrupted: bool,
}

/// Item whose rows are buffered until the next item starts
struct PendingItem {
    index: i64,
    item_id: i64,
    rows: Vec<(String, String, String)>,
}

/// Progress of one run, persisted with every commit
struct Progress {
    committed_index: i64,
    last_item_id: Option<i64>,
    items: usize,
    rows: usize,
    uncommitted: usize,
    /// Item whose rows are being written right now
    writing: Option<i64>,
}

pub struct K10plusImporter<'a> {
    store: &'a IntermediateStore,
    commit_every: usize,
    cancel: CancelFlag,
    line_limit: Option<usize>,
}

impl<'a> K10plusImporter<'a> {
    pub fn new(store: &'a IntermediateStore) -> Self {
        Self {
            store,
            commit_every: DEFAULT_COMMIT_EVERY,
            cancel: CancelFlag::new(),
            line_limit: None,
        }
    }

    pub fn with_commit_every(mut self, items: usize) -> Self {
        self.commit_every = items.max(1);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stop after reading `lines` lines, as if cancelled there
    pub fn with_line_limit(mut self, lines: usize) -> Self {
        self.line_limit = Some(lines);
        self
    }

    fn basename(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }

    /// Checkpoint stored for `path` (matched by file name)
    pub fn resume_token(&self, path: impl AsRef<Path>) -> Result<ResumeToken> {
        let repo = self.store.repo();
        let item_id_offset = repo
            .query_one("SELECT max(to_item_id) AS max_id FROM k10plus_source", &[])?
            .and_then(|r| r.integer("max_id"))
            .unwrap_or(0);
        let file = repo.query_one(
            "SELECT \"offset\" FROM k10plus_source WHERE filename = ?1",
            &[Value::from(Self::basename(path.as_ref()))],
        )?;
        Ok(ResumeToken {
            item_id_offset,
            offset: file
                .as_ref()
                .and_then(|r| r.integer("offset"))
                .unwrap_or(0),
            started: file.is_some(),
        })
    }

    /// Import several files in order, sharing the item id sequence
    ///
    /// A run cut short by the line limit ends the batch: the last outcome is
    /// the interrupted one. Cancellation fails with [`EtlError::Interrupted`]
    /// after progress is persisted.
    pub fn import_files<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<ImportOutcome>> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let token = self.resume_token(path)?;
            let outcome = self.import_file(path, token)?;
            let interrupted = outcome.interrupted;
            if interrupted && self.cancel.is_cancelled() {
                return Err(EtlError::Interrupted(format!(
                    "import of {} stopped at item {}, progress saved; run again to resume",
                    path.display(),
                    outcome.token.offset
                )));
            }
            outcomes.push(outcome);
            if interrupted {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Import one file starting from `token`
    pub fn import_file(&self, path: impl AsRef<Path>, token: ResumeToken) -> Result<ImportOutcome> {
        let path = path.as_ref();
        let basename = Self::basename(path);
        let repo = self.store.repo();
        let started = Instant::now();

        info!(
            file = %path.display(),
            item_id_offset = token.item_id_offset,
            offset = token.offset,
            "importing K10plus file"
        );

        if !token.started {
            repo.execute(
                "INSERT INTO k10plus_source (filename, \"offset\", from_item_id) VALUES (?1, 0, ?2)",
                &[Value::from(basename.as_str()), Value::from(token.item_id_offset + 1)],
            )?;
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut progress = Progress {
            committed_index: token.offset,
            last_item_id: None,
            items: 0,
            rows: 0,
            uncommitted: 0,
            writing: None,
        };
        let mut skipped = 0;
        let mut tx = Transaction::begin(repo)?;

        let result = self.scan(&mut reader, &token, repo, &basename, &mut progress, &mut skipped, &mut tx);

        // progress is persisted whether the scan finished, stopped or failed
        let persisted = Self::discard_partial(repo, &progress)
            .and_then(|()| Self::checkpoint(repo, &basename, &progress))
            .and_then(|()| tx.commit());
        let interrupted = match (result, persisted) {
            (Ok(interrupted), Ok(())) => interrupted,
            (Err(e), persisted) => {
                if let Err(p) = persisted {
                    warn!(file = %basename, error = %p, "failed to persist progress after error");
                }
                return Err(e);
            },
            (Ok(_), Err(e)) => return Err(e),
        };

        let outcome = ImportOutcome {
            token: ResumeToken {
                item_id_offset: progress.last_item_id.unwrap_or(token.item_id_offset),
                offset: progress.committed_index,
                started: true,
            },
            items: progress.items,
            rows: progress.rows,
            skipped,
            interrupted,
        };
        info!(
            file = %basename,
            items = outcome.items,
            rows = outcome.rows,
            skipped = outcome.skipped,
            interrupted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "K10plus file done"
        );
        Ok(outcome)
    }

    /// Returns `true` when stopped early
    #[allow(clippy::too_many_arguments)]
    fn scan<'t>(
        &self,
        reader: &mut impl BufRead,
        token: &ResumeToken,
        repo: &'t dyn Repository,
        basename: &str,
        progress: &mut Progress,
        skipped: &mut usize,
        tx: &mut Transaction<'t>,
    ) -> Result<bool> {
        let mut buf = Vec::new();
        let mut lines = 0usize;
        let mut index = 0i64;
        let mut next_item_id = token.item_id_offset;
        let mut pending: Option<PendingItem> = None;
        let mut skipping = false;

        loop {
            if self.cancel.is_cancelled() {
                warn!(file = %basename, "import cancelled, discarding unfinished item");
                return Ok(true);
            }
            if self.line_limit.is_some_and(|limit| lines >= limit) {
                debug!(file = %basename, lines, "line limit reached");
                return Ok(true);
            }

            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            lines += 1;
            let line = String::from_utf8_lossy(&buf);

            match parse_line(&line) {
                Line::Other => {},
                Line::Object => {
                    if let Some(item) = pending.take() {
                        self.finish_item(repo, basename, item, progress, tx)?;
                    }
                    index += 1;
                    skipping = index <= token.offset;
                    if skipping {
                        *skipped += 1;
                        continue;
                    }
                    next_item_id += 1;
                    pending = Some(PendingItem {
                        index,
                        item_id: next_item_id,
                        rows: Vec::new(),
                    });
                },
                Line::Record { field, parts } => {
                    if skipping {
                        continue;
                    }
                    let Some(item) = pending.as_mut() else {
                        debug!(file = %basename, field = %field, "record before first item ignored");
                        continue;
                    };
                    for (subfield, values) in group_line(&parts) {
                        for value in values {
                            item.rows.push((field.clone(), subfield.clone(), value));
                        }
                    }
                },
            }
        }

        if let Some(item) = pending.take() {
            self.finish_item(repo, basename, item, progress, tx)?;
        }
        Ok(false)
    }

    /// Write a complete item and commit every `commit_every` items
    fn finish_item<'t>(
        &self,
        repo: &'t dyn Repository,
        basename: &str,
        item: PendingItem,
        progress: &mut Progress,
        tx: &mut Transaction<'t>,
    ) -> Result<()> {
        progress.writing = Some(item.item_id);
        for (feld, unterfeld, wert) in &item.rows {
            repo.execute(
                "INSERT INTO k10plus_data (item_id, feld, unterfeld, wert) VALUES (?1, ?2, ?3, ?4)",
                &[
                    Value::from(item.item_id),
                    Value::from(feld.as_str()),
                    Value::from(unterfeld.as_str()),
                    Value::from(wert.as_str()),
                ],
            )?;
        }
        progress.writing = None;
        progress.committed_index = item.index;
        progress.last_item_id = Some(item.item_id);
        progress.items += 1;
        progress.rows += item.rows.len();
        progress.uncommitted += 1;

        if item.item_id % PROGRESS_EVERY == 0 {
            info!(file = %basename, item_id = item.item_id, "K10plus progress");
        }

        if progress.uncommitted >= self.commit_every {
            Self::checkpoint(repo, basename, progress)?;
            tx.restart()?;
            progress.uncommitted = 0;
        }
        Ok(())
    }

    /// Remove rows of an item that failed half-way through writing
    fn discard_partial(repo: &dyn Repository, progress: &Progress) -> Result<()> {
        if let Some(item_id) = progress.writing {
            repo.execute(
                "DELETE FROM k10plus_data WHERE item_id = ?1",
                &[Value::from(item_id)],
            )?;
        }
        Ok(())
    }

    fn checkpoint(repo: &dyn Repository, basename: &str, progress: &Progress) -> Result<()> {
        repo.execute(
            "UPDATE k10plus_source SET \"offset\" = ?1, to_item_id = coalesce(?2, to_item_id) WHERE filename = ?3",
            &[
                Value::from(progress.committed_index),
                Value::from(progress.last_item_id),
                Value::from(basename),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RECORDS: &str = "\u{1d}\n\
        \u{1e}003@ \u{1f}0100\n\
        \u{1e}021A \u{1f}aErster Titel\u{1f}hAutor A\n\
        \u{1d}\n\
        \u{1e}003@ \u{1f}0200\n\
        \u{1e}021A $aZweiter Titel\n\
        \u{1d}\n\
        \u{1e}003@ \u{1f}0300\n\
        \u{1e}044K \u{1f}aFoto\u{1f}aBild\n";

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn data(store: &IntermediateStore) -> Vec<(i64, String, String, String)> {
        store
            .repo()
            .query(
                "SELECT item_id, feld, unterfeld, wert FROM k10plus_data ORDER BY id",
                &[],
            )
            .unwrap()
            .iter()
            .map(|r| {
                (
                    r.integer("item_id").unwrap(),
                    r.text("feld").unwrap(),
                    r.text("unterfeld").unwrap(),
                    r.text("wert").unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_single_pass() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "titel.pp", RECORDS);
        let store = IntermediateStore::in_memory().unwrap();
        let importer = K10plusImporter::new(&store);

        let token = importer.resume_token(&path).unwrap();
        assert!(!token.started);
        let outcome = importer.import_file(&path, token).unwrap();
        assert_eq!(outcome.items, 3);
        assert_eq!(outcome.rows, 8);
        assert!(!outcome.interrupted);
        assert_eq!(outcome.token.item_id_offset, 3);
        assert_eq!(outcome.token.offset, 3);

        let rows = data(&store);
        assert_eq!(rows[0], (1, "003@".into(), "0".into(), "100".into()));
        assert_eq!(rows[3], (2, "003@".into(), "0".into(), "200".into()));
        assert_eq!(rows[4], (2, "021A".into(), "a".into(), "Zweiter Titel".into()));
        assert_eq!(rows[7], (3, "044K".into(), "a".into(), "Bild".into()));

        let stored = importer.resume_token(&path).unwrap();
        assert_eq!(stored.offset, 3);
        assert_eq!(stored.item_id_offset, 3);
    }

    #[test]
    fn test_line_limit_discards_unfinished_item() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "titel.pp", RECORDS);
        let store = IntermediateStore::in_memory().unwrap();

        // five lines end inside the second item
        let outcome = K10plusImporter::new(&store)
            .with_line_limit(5)
            .import_file(&path, ResumeToken::default())
            .unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.items, 1);
        assert_eq!(outcome.token.offset, 1);
        assert!(data(&store).iter().all(|(item, ..)| *item == 1));
    }

    #[test]
    fn test_resume_after_line_limit_matches_single_pass() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "titel.pp", RECORDS);

        let single = IntermediateStore::in_memory().unwrap();
        let importer = K10plusImporter::new(&single);
        importer
            .import_file(&path, importer.resume_token(&path).unwrap())
            .unwrap();

        let resumed = IntermediateStore::in_memory().unwrap();
        K10plusImporter::new(&resumed)
            .with_line_limit(5)
            .import_file(&path, ResumeToken::default())
            .unwrap();
        let importer = K10plusImporter::new(&resumed);
        let token = importer.resume_token(&path).unwrap();
        assert!(token.started);
        let outcome = importer.import_file(&path, token).unwrap();
        assert_eq!(outcome.items, 2);
        assert!(!outcome.interrupted);

        assert_eq!(data(&resumed), data(&single));
        assert_eq!(data(&resumed).len(), 8);
    }

    #[test]
    fn test_line_limit_ends_file_batch() {
        let dir = TempDir::new().unwrap();
        let first = write_file(&dir, "a.pp", RECORDS);
        let second = write_file(&dir, "b.pp", "\u{1d}\n\u{1e}003@ \u{1f}0900\n");
        let store = IntermediateStore::in_memory().unwrap();

        let outcomes = K10plusImporter::new(&store)
            .with_line_limit(5)
            .import_files(&[&first, &second])
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].interrupted);
        assert!(!K10plusImporter::new(&store).resume_token(&second).unwrap().started);

        let outcomes = K10plusImporter::new(&store)
            .import_files(&[&first, &second])
            .unwrap();
        assert_eq!((outcomes[0].items, outcomes[0].skipped), (2, 1));
        assert_eq!(outcomes[1].items, 1);
        assert_eq!(outcomes[1].token.item_id_offset, 4);
    }

    #[test]
    fn test_cancelled_run_persists_and_reports() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "titel.pp", RECORDS);
        let store = IntermediateStore::in_memory().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = K10plusImporter::new(&store)
            .with_cancel_flag(cancel)
            .import_files(&[&path])
            .unwrap_err();
        assert!(matches!(err, EtlError::Interrupted(_)));
        let token = K10plusImporter::new(&store).resume_token(&path).unwrap();
        assert!(token.started);
        assert_eq!(token.offset, 0);
    }

    #[test]
    fn test_files_share_item_sequence() {
        let dir = TempDir::new().unwrap();
        let first = write_file(&dir, "a.pp", RECORDS);
        let second = write_file(&dir, "b.pp", "\u{1d}\n\u{1e}003@ \u{1f}0900\n");
        let store = IntermediateStore::in_memory().unwrap();

        let outcomes = K10plusImporter::new(&store)
            .with_commit_every(2)
            .import_files(&[&first, &second])
            .unwrap();
        assert_eq!(outcomes[1].token.item_id_offset, 4);

        let sources = store.repo().extract_table("k10plus_source").unwrap();
        assert_eq!(sources[1].integer("from_item_id"), Some(4));
        assert_eq!(sources[1].integer("to_item_id"), Some(4));

        // a second run over finished files adds nothing
        let again = K10plusImporter::new(&store)
            .import_files(&[&first, &second])
            .unwrap();
        assert!(again.iter().all(|o| o.items == 0));
        assert_eq!(data(&store).len(), 9);
    }
}
