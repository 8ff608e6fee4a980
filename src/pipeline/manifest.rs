use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, ReaderBuilder, Terminator, Writer, WriterBuilder};

use crate::error::ManifestError;
use crate::metrics::Score;
use crate::model::{Prompt, PromptMode, RefineVariant, Watermark};
use crate::util::{format_percent, partial_path};

pub const MANIFEST_FIELDS: [&str; 10] = [
    "image",
    "mode",
    "box",
    "points",
    "point_labels",
    "done",
    "persam_IoU",
    "persam_Acc",
    "persam_f_IoU",
    "persam_f_Acc",
];

pub const DELIMITER: u8 = b';';
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestRow {
    pub image: String,
    pub mode: String,
    pub box_prompt: String,
    pub points: String,
    pub point_labels: String,
    pub done: Watermark,
    pub persam_iou: String,
    pub persam_acc: String,
    pub persam_f_iou: String,
    pub persam_f_acc: String,
}

impl ManifestRow {
    /// Image name without a trailing `.jpg`/`.jpeg`.
    pub fn image_id(&self) -> &str {
        let image = self.image.trim();
        let lower = image.to_ascii_lowercase();
        for extension in [".jpg", ".jpeg"] {
            if lower.ends_with(extension) && image.len() > extension.len() {
                return &image[..image.len() - extension.len()];
            }
        }
        image
    }

    pub fn prompt_mode(&self) -> Option<PromptMode> {
        PromptMode::parse(&self.mode)
    }

    pub fn prompt(&self) -> Result<Prompt, String> {
        Prompt::from_fields(&self.mode, &self.box_prompt, &self.points, &self.point_labels)
    }

    pub fn set_metrics(&mut self, variant: RefineVariant, score: Score) {
        let percent = score.percent();
        let (iou, acc) = match variant {
            RefineVariant::ZeroShot => (&mut self.persam_iou, &mut self.persam_acc),
            RefineVariant::FineTuned => (&mut self.persam_f_iou, &mut self.persam_f_acc),
        };
        *iou = format_percent(percent.iou);
        *acc = format_percent(percent.accuracy);
    }

    /// Persisted percentages for one variant, if both parse.
    pub fn metrics(&self, variant: RefineVariant) -> Option<Score> {
        let (iou, acc) = match variant {
            RefineVariant::ZeroShot => (&self.persam_iou, &self.persam_acc),
            RefineVariant::FineTuned => (&self.persam_f_iou, &self.persam_f_acc),
        };
        Some(Score {
            iou: iou.trim().parse().ok()?,
            accuracy: acc.trim().parse().ok()?,
        })
    }

    fn field(&self, name: &str) -> String {
        match name {
            "image" => self.image.clone(),
            "mode" => self.mode.clone(),
            "box" => self.box_prompt.clone(),
            "points" => self.points.clone(),
            "point_labels" => self.point_labels.clone(),
            "done" => self.done.to_string(),
            "persam_IoU" => self.persam_iou.clone(),
            "persam_Acc" => self.persam_acc.clone(),
            "persam_f_IoU" => self.persam_f_iou.clone(),
            "persam_f_Acc" => self.persam_f_acc.clone(),
            _ => String::new(),
        }
    }
}

/// Byte-level details of the source file, reproduced on rewrite.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ManifestFormat {
    pub byte_order_mark: bool,
    pub crlf: bool,
}

impl Default for ManifestFormat {
    fn default() -> Self {
        Self {
            byte_order_mark: true,
            crlf: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Manifest {
    path: PathBuf,
    target: String,
    headers: Vec<String>,
    rows: Vec<ManifestRow>,
    format: ManifestFormat,
}

impl Manifest {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[ManifestRow] {
        &self.rows
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn into_rows(self) -> Vec<ManifestRow> {
        self.rows
    }
}

/// The target a manifest describes is its file stem.
pub fn target_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(ToOwned::to_owned)
}

pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
    let raw = fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ManifestError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ManifestError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let malformed = |reason: String| ManifestError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let target =
        target_name(path).ok_or_else(|| malformed("file name is not valid UTF-8".to_string()))?;

    let (byte_order_mark, body) = match raw.strip_prefix(UTF8_BOM) {
        Some(rest) => (true, rest),
        None => (false, raw.as_slice()),
    };
    let crlf = !body.contains(&b'\n') || body.windows(2).any(|pair| pair == b"\r\n");

    let mut reader = ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(true)
        .flexible(false)
        .from_reader(body);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| malformed(format!("unreadable header: {err}")))?
        .iter()
        .map(ToOwned::to_owned)
        .collect();
    validate_headers(&headers).map_err(malformed)?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let line = index + 2;
        let record = record.map_err(|err| malformed(format!("row {line}: {err}")))?;

        let mut row = ManifestRow::default();
        for (name, value) in headers.iter().zip(record.iter()) {
            let value = value.to_string();
            match name.as_str() {
                "image" => row.image = value,
                "mode" => row.mode = value,
                "box" => row.box_prompt = value,
                "points" => row.points = value,
                "point_labels" => row.point_labels = value,
                "done" => {
                    row.done = Watermark::parse(&value).ok_or_else(|| {
                        malformed(format!("row {line}: invalid done marker `{value}`"))
                    })?;
                }
                "persam_IoU" => row.persam_iou = value,
                "persam_Acc" => row.persam_acc = value,
                "persam_f_IoU" => row.persam_f_iou = value,
                "persam_f_Acc" => row.persam_f_acc = value,
                _ => {}
            }
        }
        rows.push(row);
    }

    Ok(Manifest {
        path: path.to_path_buf(),
        target,
        headers,
        rows,
        format: ManifestFormat {
            byte_order_mark,
            crlf,
        },
    })
}

fn validate_headers(headers: &[String]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for header in headers {
        if !seen.insert(header.as_str()) {
            return Err(format!("duplicate column `{header}`"));
        }
    }

    let missing: Vec<&str> = MANIFEST_FIELDS
        .iter()
        .copied()
        .filter(|field| !seen.contains(field))
        .collect();
    let unexpected: Vec<&str> = headers
        .iter()
        .map(String::as_str)
        .filter(|header| !MANIFEST_FIELDS.contains(header))
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }
    Err(format!(
        "field set mismatch (is the delimiter `;`?): missing [{}], unexpected [{}]",
        missing.join(", "),
        unexpected.join(", ")
    ))
}

/// An in-progress rewrite of a manifest into its sibling `.partial` file.
pub struct ManifestRewrite {
    temp_path: PathBuf,
    headers: Vec<String>,
    writer: Writer<File>,
    rows_written: usize,
}

impl ManifestRewrite {
    /// Creates the sibling file and writes the header before any row is processed.
    pub fn begin(manifest: &Manifest) -> Result<Self, ManifestError> {
        let temp_path = partial_path(manifest.path());
        let io_error = |source| ManifestError::Io {
            path: temp_path.clone(),
            source,
        };

        let mut file = File::create(&temp_path).map_err(io_error)?;
        let format = manifest.format();
        if format.byte_order_mark {
            file.write_all(UTF8_BOM).map_err(io_error)?;
        }

        let terminator = if format.crlf {
            Terminator::CRLF
        } else {
            Terminator::Any(b'\n')
        };
        let writer = WriterBuilder::new()
            .delimiter(DELIMITER)
            .quote_style(QuoteStyle::Necessary)
            .terminator(terminator)
            .from_writer(file);

        let mut rewrite = Self {
            temp_path,
            headers: manifest.headers().to_vec(),
            writer,
            rows_written: 0,
        };
        let headers = rewrite.headers.clone();
        rewrite.write_record(&headers)?;
        Ok(rewrite)
    }

    /// Appends one row and flushes it to disk.
    pub fn append_row(&mut self, row: &ManifestRow) -> Result<(), ManifestError> {
        let record: Vec<String> = self.headers.iter().map(|name| row.field(name)).collect();
        self.write_record(&record)?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Replaces `original` with the rewritten file.
    pub fn commit(self, original: &Path) -> Result<(), ManifestError> {
        let temp_path = self.temp_path;
        let file = self
            .writer
            .into_inner()
            .map_err(|err| ManifestError::Io {
                path: temp_path.clone(),
                source: io::Error::new(err.error().kind(), err.error().to_string()),
            })?;
        file.sync_all().map_err(|source| ManifestError::Io {
            path: temp_path.clone(),
            source,
        })?;
        drop(file);

        fs::rename(&temp_path, original).map_err(|source| classify_commit_error(original, source))
    }

    fn write_record(&mut self, record: &[String]) -> Result<(), ManifestError> {
        self.writer
            .write_record(record)
            .map_err(|source| ManifestError::Write {
                path: self.temp_path.clone(),
                source,
            })?;
        self.writer.flush().map_err(|source| ManifestError::Io {
            path: self.temp_path.clone(),
            source,
        })
    }
}

fn classify_commit_error(original: &Path, source: io::Error) -> ManifestError {
    if source.kind() == io::ErrorKind::PermissionDenied {
        ManifestError::CommitPermissionDenied {
            path: original.to_path_buf(),
            source,
        }
    } else {
        ManifestError::Io {
            path: original.to_path_buf(),
            source,
        }
    }
}
