use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::format::{read_frame, read_header, BackupHeader, BackupRecord, FrameCodec, FrameRead, HEADER_LEN, VERSION};
use super::BackupFlags;
use crate::cipher::{KdfSalt, PageCipher};
use crate::config::EngineConfig;
use crate::{AppError, AppResult};

/// Where an incremental run resumes.
#[derive(Debug, Clone, Copy)]
struct AppendPoint {
    offset: u64,
    frames: u64,
    torn: bool,
}

/// Buffers records into frames and appends them to the backup file.
pub(crate) struct BackupWriter {
    path: PathBuf,
    file: File,
    header: BackupHeader,
    codec: FrameCodec,
    append: Option<AppendPoint>,
    frame_statements: usize,
    frame_bytes: usize,
    pending: Vec<BackupRecord>,
    pending_statements: u64,
    pending_bytes: usize,
    next_frame: u64,
    statements: u64,
}

impl std::fmt::Debug for BackupWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupWriter")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("next_frame", &self.next_frame)
            .field("statements", &self.statements)
            .finish()
    }
}

fn init_error(detail: &str, message: &str, path: &Path) -> AppError {
    AppError::init(detail, message).with_context("path", path.display().to_string())
}

impl BackupWriter {
    /// Opens `path` without truncating it. With `INCREMENTAL` and an
    /// existing file, the header must match the requested cipher and
    /// compression and the key must open the first frame.
    pub(crate) fn open(
        path: &Path,
        key: Option<&[u8]>,
        flags: BackupFlags,
        config: &EngineConfig,
    ) -> AppResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| init_error("OPEN_OUTPUT", "Backup output could not be opened", path).with_cause(err))?;
        let existing_len = file
            .metadata()
            .map_err(|err| init_error("OPEN_OUTPUT", "Backup output could not be inspected", path).with_cause(err))?
            .len();

        let cipher_key = key.filter(|_| !flags.contains(BackupFlags::NO_CIPHER));
        let compress = !flags.contains(BackupFlags::NO_COMPRESS);
        let level = compress.then_some(config.compression_level);

        if flags.contains(BackupFlags::INCREMENTAL) && existing_len > 0 {
            return Self::open_append(path.to_path_buf(), file, cipher_key, compress, level, config);
        }

        let salt = if cipher_key.is_some() {
            KdfSalt::random()
        } else {
            KdfSalt([0; crate::cipher::SALT_LEN])
        };
        let kdf_iterations = if cipher_key.is_some() {
            config.file_kdf_iterations
        } else {
            0
        };
        let cipher = match cipher_key {
            Some(key) => Some(
                PageCipher::from_passphrase(key, &salt, kdf_iterations)
                    .map_err(|err| init_error("KEY_SCHEDULE", "Backup key could not be derived", path).with_cause(err))?,
            ),
            None => None,
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header: BackupHeader {
                version: VERSION,
                cipher: cipher.is_some(),
                compress,
                salt,
                kdf_iterations,
            },
            codec: FrameCodec::new(cipher, level),
            append: None,
            frame_statements: config.frame_statements,
            frame_bytes: config.frame_bytes,
            pending: Vec::new(),
            pending_statements: 0,
            pending_bytes: 0,
            next_frame: 0,
            statements: 0,
        })
    }

    fn open_append(
        path: PathBuf,
        mut file: File,
        key: Option<&[u8]>,
        compress: bool,
        level: Option<i32>,
        config: &EngineConfig,
    ) -> AppResult<Self> {
        let header = {
            let mut reader = BufReader::new(&mut file);
            read_header(&mut reader).map_err(|err| {
                init_error("BAD_HEADER", "Existing backup has an unreadable header", &path).with_cause(err)
            })?
        };
        if header.cipher != key.is_some() || header.compress != compress {
            return Err(init_error(
                "FLAGS_MISMATCH",
                "Existing backup was written with different cipher or compression settings",
                &path,
            )
            .with_context("existing_cipher", header.cipher.to_string())
            .with_context("existing_compress", header.compress.to_string()));
        }
        let cipher = match key {
            Some(key) => Some(
                PageCipher::from_passphrase(key, &header.salt, header.kdf_iterations)
                    .map_err(|err| init_error("KEY_SCHEDULE", "Backup key could not be derived", &path).with_cause(err))?,
            ),
            None => None,
        };
        let codec = FrameCodec::new(cipher, level);
        let append = scan_frames(&mut file, &codec, &path)?;

        Ok(Self {
            path,
            file,
            header,
            codec,
            append: Some(append),
            frame_statements: config.frame_statements,
            frame_bytes: config.frame_bytes,
            pending: Vec::new(),
            pending_statements: 0,
            pending_bytes: 0,
            next_frame: append.frames,
            statements: 0,
        })
    }

    pub(crate) fn header(&self) -> &BackupHeader {
        &self.header
    }

    /// Prepares the file for a run: a fresh header, or the end of the last
    /// intact frame when appending.
    pub(crate) fn begin(&mut self) -> AppResult<()> {
        self.pending.clear();
        self.pending_statements = 0;
        self.pending_bytes = 0;
        self.statements = 0;
        let io_err = |err: std::io::Error, op: &str| {
            AppError::from(err)
                .with_context("operation", op.to_string())
                .with_context("path", self.path.display().to_string())
        };
        match self.append {
            Some(append) => {
                if append.torn {
                    tracing::warn!(
                        target: "repairkit",
                        event = "backup_torn_tail_trimmed",
                        path = %self.path.display(),
                        offset = append.offset
                    );
                }
                self.file.set_len(append.offset).map_err(|err| io_err(err, "trim_backup"))?;
                self.file
                    .seek(SeekFrom::Start(append.offset))
                    .map_err(|err| io_err(err, "seek_backup"))?;
                self.next_frame = append.frames;
            }
            None => {
                self.file.set_len(0).map_err(|err| io_err(err, "truncate_backup"))?;
                self.file.seek(SeekFrom::Start(0)).map_err(|err| io_err(err, "seek_backup"))?;
                self.file
                    .write_all(&self.header.encode())
                    .map_err(|err| io_err(err, "write_backup_header"))?;
                self.next_frame = 0;
            }
        }
        Ok(())
    }

    /// Buffers `record`. A frame is cut when it reaches the statement count
    /// or the byte budget; a record that would overshoot the budget starts
    /// a new frame.
    pub(crate) fn push(&mut self, record: BackupRecord) -> AppResult<()> {
        let bytes = record.approx_len();
        if !self.pending.is_empty() && self.pending_bytes.saturating_add(bytes) > self.frame_bytes {
            self.flush()?;
        }
        if record.is_statement() {
            self.pending_statements += 1;
        }
        self.pending_bytes = self.pending_bytes.saturating_add(bytes);
        self.pending.push(record);
        if self.pending_statements as usize >= self.frame_statements || self.pending_bytes >= self.frame_bytes {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes buffered records as one frame.
    pub(crate) fn flush(&mut self) -> AppResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let frame = self.codec.encode(self.next_frame, &self.pending)?;
        self.file.write_all(&frame).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_backup_frame")
                .with_context("path", self.path.display().to_string())
        })?;
        tracing::debug!(
            target: "repairkit",
            event = "backup_frame_flushed",
            frame = self.next_frame,
            records = self.pending.len(),
            bytes = frame.len()
        );
        self.next_frame += 1;
        self.statements += self.pending_statements;
        self.pending.clear();
        self.pending_statements = 0;
        self.pending_bytes = 0;
        let offset = self.file.stream_position().map_err(AppError::from)?;
        if let Some(append) = self.append.as_mut() {
            append.offset = offset;
            append.frames = self.next_frame;
            append.torn = false;
        }
        Ok(())
    }

    /// Flushes and syncs. Later runs append after what was written here
    /// when the session is incremental.
    pub(crate) fn finish(&mut self) -> AppResult<()> {
        self.flush()?;
        self.file.sync_all().map_err(|err| {
            AppError::from(err)
                .with_context("operation", "sync_backup")
                .with_context("path", self.path.display().to_string())
        })
    }

    /// Statements written to disk since [`BackupWriter::begin`].
    pub(crate) fn statement_count(&self) -> u64 {
        self.statements
    }
}

/// Finds the end of the last intact frame, checking the key against the
/// first one.
fn scan_frames(file: &mut File, codec: &FrameCodec, path: &Path) -> AppResult<AppendPoint> {
    file.seek(SeekFrom::Start(HEADER_LEN as u64))
        .map_err(AppError::from)?;
    let mut reader = BufReader::new(&mut *file);
    let mut offset = HEADER_LEN as u64;
    let mut frames = 0u64;
    let mut torn = false;
    loop {
        match read_frame(&mut reader).map_err(AppError::from)? {
            FrameRead::End => break,
            FrameRead::Torn => {
                torn = true;
                break;
            }
            FrameRead::Frame(payload) => {
                if frames == 0 {
                    codec.decode(0, &payload).map_err(|err| {
                        init_error("WRONG_KEY", "Existing backup cannot be read with this key", path)
                            .with_cause(err)
                    })?;
                }
                offset += (super::format::FRAME_HEADER_LEN + payload.len()) as u64;
                frames += 1;
            }
        }
    }
    Ok(AppendPoint {
        offset,
        frames,
        torn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::format::SqlValue;
    use tempfile::tempdir;

    fn row(id: i64) -> BackupRecord {
        BackupRecord::Row {
            rowid: Some(id),
            values: vec![SqlValue::Integer(id)],
        }
    }

    fn config(frame_statements: usize) -> EngineConfig {
        EngineConfig {
            frame_statements,
            file_kdf_iterations: 1,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn frames_flush_at_threshold() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.rkbk");
        let mut writer = BackupWriter::open(&path, None, BackupFlags::empty(), &config(2)).expect("open");
        writer.begin().expect("begin");
        writer
            .push(BackupRecord::Table {
                name: "t".into(),
                columns: vec!["id".into()],
            })
            .expect("table");
        writer.push(row(1)).expect("row");
        assert_eq!(writer.statement_count(), 0);
        writer.push(row(2)).expect("row");
        assert_eq!(writer.statement_count(), 2);
        writer.push(row(3)).expect("row");
        writer.finish().expect("finish");
        assert_eq!(writer.statement_count(), 3);
    }

    #[test]
    fn incremental_requires_matching_flags() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.rkbk");
        let mut writer = BackupWriter::open(&path, None, BackupFlags::empty(), &config(8)).expect("open");
        writer.begin().expect("begin");
        writer.push(row(1)).expect("row");
        writer.finish().expect("finish");
        drop(writer);

        let err = BackupWriter::open(
            &path,
            None,
            BackupFlags::INCREMENTAL | BackupFlags::NO_COMPRESS,
            &config(8),
        )
        .expect_err("mismatch");
        assert_eq!(err.code(), "INIT/FLAGS_MISMATCH");

        let appended = BackupWriter::open(&path, None, BackupFlags::INCREMENTAL, &config(8)).expect("append");
        assert_eq!(appended.next_frame, 1);
    }

    #[test]
    fn incremental_rejects_wrong_key() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.rkbk");
        let mut writer = BackupWriter::open(&path, Some(b"right"), BackupFlags::empty(), &config(8)).expect("open");
        writer.begin().expect("begin");
        writer.push(row(1)).expect("row");
        writer.finish().expect("finish");
        drop(writer);

        let err = BackupWriter::open(&path, Some(b"wrong"), BackupFlags::INCREMENTAL, &config(8))
            .expect_err("wrong key");
        assert_eq!(err.code(), "INIT/WRONG_KEY");
    }

    fn frames_on_disk(path: &Path) -> Vec<Vec<BackupRecord>> {
        let codec = FrameCodec::new(None, None);
        let mut reader = BufReader::new(File::open(path).expect("reopen"));
        read_header(&mut reader).expect("header");
        let mut frames = Vec::new();
        while let FrameRead::Frame(payload) = read_frame(&mut reader).expect("frame") {
            frames.push(codec.decode(frames.len() as u64, &payload).expect("decode"));
        }
        frames
    }

    fn blob_row(id: i64, len: usize) -> BackupRecord {
        BackupRecord::Row {
            rowid: Some(id),
            values: vec![SqlValue::Blob(vec![id as u8; len])],
        }
    }

    #[test]
    fn large_rows_split_frames_on_byte_budget() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.rkbk");
        let config = EngineConfig {
            frame_bytes: 64 * 1024,
            ..config(256)
        };
        let mut writer = BackupWriter::open(&path, None, BackupFlags::NO_COMPRESS, &config).expect("open");
        writer.begin().expect("begin");
        writer
            .push(BackupRecord::Table {
                name: "t".into(),
                columns: vec!["v".into()],
            })
            .expect("table");
        for id in 1..=6 {
            writer.push(blob_row(id, 40_000)).expect("row");
        }
        writer.finish().expect("finish");
        assert_eq!(writer.statement_count(), 6);

        let frames = frames_on_disk(&path);
        assert_eq!(frames.len(), 6);
        let rows = frames.iter().flatten().filter(|r| r.is_statement()).count();
        assert_eq!(rows, 6);
    }

    #[test]
    fn oversized_row_gets_a_frame_of_its_own() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.rkbk");
        let config = EngineConfig {
            frame_bytes: 64 * 1024,
            ..config(256)
        };
        let mut writer = BackupWriter::open(&path, None, BackupFlags::NO_COMPRESS, &config).expect("open");
        writer.begin().expect("begin");
        writer.push(row(1)).expect("small row");
        writer.push(blob_row(2, 200_000)).expect("big row");
        writer.push(row(3)).expect("small row");
        writer.finish().expect("finish");

        let sizes: Vec<usize> = frames_on_disk(&path).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }
}
