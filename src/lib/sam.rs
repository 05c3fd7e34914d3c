//! Owned output records and SAM/FASTQ text serialization.
//!
//! The pipeline treats output records as opaque values: this module defines
//! the owned [`SamRecord`] type, its auxiliary tags, and the text encodings
//! the writer emits. Binary BAM encoding is intentionally not implemented.

use bstr::ByteSlice;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::errors::{Result, SquallError};

/// Flag bit for an unmapped record.
pub const FLAG_UNMAPPED: u16 = 0x4;
/// Flag bit for a reverse-strand alignment.
pub const FLAG_REVERSE: u16 = 0x10;
/// Flag bit for a supplementary alignment.
pub const FLAG_SUPPLEMENTARY: u16 = 0x800;

/// Value of one auxiliary tag.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Int(i64),
    Float(f32),
    String(String),
    /// `B:c` array (signed bytes fit the move table's 0/1 entries).
    ByteArray(Vec<u8>),
}

/// A two-character auxiliary tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: [u8; 2],
    pub value: TagValue,
}

impl Tag {
    #[must_use]
    pub fn new(name: [u8; 2], value: TagValue) -> Self {
        Self { name, value }
    }
}

/// An owned alignment/output record.
#[derive(Debug, Clone, Default)]
pub struct SamRecord {
    pub qname: String,
    pub flags: u16,
    /// Target sequence name; `None` when unmapped.
    pub target: Option<String>,
    /// 0-based leftmost position on the target.
    pub pos: usize,
    pub mapq: u8,
    pub cigar: String,
    pub seq: Vec<u8>,
    /// Raw phred values (not ASCII-encoded).
    pub qual: Vec<u8>,
    pub tags: Vec<Tag>,
}

impl SamRecord {
    /// An unmapped record carrying sequence and qualities.
    #[must_use]
    pub fn unmapped(qname: String, seq: Vec<u8>, qual: Vec<u8>) -> Self {
        Self { qname, flags: FLAG_UNMAPPED, seq, qual, ..Self::default() }
    }

    /// Append a tag, replacing any existing tag of the same name.
    pub fn set_tag(&mut self, name: [u8; 2], value: TagValue) {
        self.tags.retain(|t| t.name != name);
        self.tags.push(Tag::new(name, value));
    }

    /// Look up a tag by name.
    #[must_use]
    pub fn tag(&self, name: [u8; 2]) -> Option<&TagValue> {
        self.tags.iter().find(|t| t.name == name).map(|t| &t.value)
    }

    /// Serialize to one SAM text line (no trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`SquallError::BadRecord`] when the qualities and sequence
    /// lengths disagree, or the name contains field separators.
    pub fn to_sam_line(&self) -> Result<String> {
        if !self.qual.is_empty() && self.qual.len() != self.seq.len() {
            return Err(SquallError::BadRecord {
                qname: self.qname.clone(),
                reason: format!(
                    "quality length {} does not match sequence length {}",
                    self.qual.len(),
                    self.seq.len()
                ),
            });
        }
        if self.qname.contains(['\t', '\n']) || self.qname.is_empty() {
            return Err(SquallError::BadRecord {
                qname: self.qname.clone(),
                reason: "query name empty or contains field separators".to_string(),
            });
        }

        let mut line = String::with_capacity(64 + 2 * self.seq.len());
        let target = self.target.as_deref().unwrap_or("*");
        let pos = if self.target.is_some() { self.pos + 1 } else { 0 };
        let cigar = if self.cigar.is_empty() { "*" } else { &self.cigar };
        let seq =
            if self.seq.is_empty() { "*".to_string() } else { self.seq.as_bstr().to_string() };
        let qual = if self.qual.is_empty() {
            "*".to_string()
        } else {
            self.qual.iter().map(|&q| char::from(q.saturating_add(33).min(126))).collect()
        };
        write!(
            line,
            "{}\t{}\t{}\t{}\t{}\t{}\t*\t0\t0\t{}\t{}",
            self.qname, self.flags, target, pos, self.mapq, cigar, seq, qual
        )
        .expect("writing to String cannot fail");

        for tag in &self.tags {
            line.push('\t');
            line.push(char::from(tag.name[0]));
            line.push(char::from(tag.name[1]));
            match &tag.value {
                TagValue::Int(v) => write!(line, ":i:{v}").unwrap(),
                TagValue::Float(v) => write!(line, ":f:{v}").unwrap(),
                TagValue::String(v) => write!(line, ":Z:{v}").unwrap(),
                TagValue::ByteArray(values) => {
                    line.push_str(":B:c");
                    for v in values {
                        write!(line, ",{v}").unwrap();
                    }
                }
            }
        }
        Ok(line)
    }

    /// Serialize to a four-line FASTQ block (with trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`SquallError::BadRecord`] when the record carries no sequence
    /// or mismatched qualities.
    pub fn to_fastq_block(&self) -> Result<String> {
        if self.seq.is_empty() || self.qual.len() != self.seq.len() {
            return Err(SquallError::BadRecord {
                qname: self.qname.clone(),
                reason: "fastq output requires a sequence with matching qualities".to_string(),
            });
        }
        let qual: String =
            self.qual.iter().map(|&q| char::from(q.saturating_add(33).min(126))).collect();
        Ok(format!("@{}\n{}\n+\n{}\n", self.qname, self.seq.as_bstr(), qual))
    }
}

/// One `@RG` entry in the output header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroup {
    pub flowcell_id: String,
    pub device_id: String,
    pub exp_start_time: String,
    pub basecalling_model: String,
    pub run_id: String,
    pub sample_id: String,
}

/// Assemble the output header lines.
///
/// Layout follows the SAM 1.6 convention: `@HD`, one `@PG` naming the
/// program and its full command line, and one `@RG` per read group.
#[must_use]
pub fn build_header(
    version: &str,
    command_line: &str,
    read_groups: &BTreeMap<String, ReadGroup>,
) -> Vec<String> {
    let mut lines = vec!["@HD\tVN:1.6\tSO:unknown".to_string()];
    lines.push(format!("@PG\tID:basecaller\tPN:squall\tVN:{version}\tCL:{command_line}"));
    for (id, rg) in read_groups {
        lines.push(format!(
            "@RG\tID:{id}\tPU:{}\tPM:{}\tDT:{}\tPL:ONT\tDS:basecall_model={} runid={}\tLB:{}\tSM:{}",
            rg.flowcell_id,
            rg.device_id,
            rg.exp_start_time,
            rg.basecalling_model,
            rg.run_id,
            rg.sample_id,
            rg.sample_id,
        ));
    }
    lines
}

/// Render a move table as the `mv` tag payload: stride first, then the moves.
#[must_use]
pub fn move_table_tag(stride: usize, moves: &[u8]) -> Vec<u8> {
    std::iter::once(stride as u8).chain(moves.iter().copied()).collect_vec()
}
