// src/utils/pairing.rs: turns an upload set into a reference genome plus paired samples

use std::fs;
use std::path::{Path, PathBuf};

use fxhash::FxHashSet;
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::defs::{PipelineError, GENOME_EXTS, READS_EXT};


/// One file as delivered by upload intake.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub original_name: String,
    pub stored_path: PathBuf,
}

impl UploadedFile {
    pub fn new(original_name: impl Into<String>, stored_path: impl Into<PathBuf>) -> Self {
        Self {
            original_name: original_name.into(),
            stored_path: stored_path.into(),
        }
    }

    /// Upload intake where the stored file keeps its own name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let stored_path = path.into();
        let original_name = stored_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { original_name, stored_path }
    }

    pub fn is_genome(&self) -> bool {
        GENOME_EXTS
            .iter()
            .any(|ext| self.original_name.ends_with(&format!(".{}", ext)))
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub name: String,
    pub read1: PathBuf,
    pub read2: PathBuf,
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceGenome {
    pub fasta: PathBuf,
    pub index_base: PathBuf,
}

impl ReferenceGenome {
    /// The bowtie2 index lives next to the fasta, named after its stem.
    pub fn from_fasta(fasta: &Path) -> Self {
        let stem = fasta
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        let index_base = match fasta.parent() {
            Some(parent) => parent.join(stem),
            None => PathBuf::from(stem),
        };
        Self {
            fasta: fasta.to_path_buf(),
            index_base,
        }
    }
}


/// Naming conventions accepted for paired-end read files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingConvention {
    /// `<base>_1.fastq.gz` / `<base>_2.fastq.gz`, the canonical layout.
    Numeric,
    /// `<base>_R1.fastq.gz` / `<base>_R2.fastq.gz`, renamed to `Numeric` on disk.
    Illumina,
}

impl PairingConvention {
    /// Order in which conventions are tried for each pair.
    pub const PRIORITY: [PairingConvention; 2] = [PairingConvention::Numeric, PairingConvention::Illumina];

    fn tags(&self) -> (&'static str, &'static str) {
        match self {
            PairingConvention::Numeric => ("_1", "_2"),
            PairingConvention::Illumina => ("_R1", "_R2"),
        }
    }

    /// Returns the shared base name if `first`/`second` are read 1 and read 2
    /// of the same sample under this convention.
    pub fn match_pair(&self, first: &str, second: &str) -> Option<String> {
        let (r1_tag, r2_tag) = self.tags();
        let base1 = first.strip_suffix(&format!("{}.{}", r1_tag, READS_EXT))?;
        let base2 = second.strip_suffix(&format!("{}.{}", r2_tag, READS_EXT))?;
        if base1.is_empty() || base1 != base2 {
            return None;
        }
        Some(base1.to_string())
    }

    /// Sample base of a read-1 file name under the first convention that fits.
    pub fn read1_base(name: &str) -> Option<&str> {
        Self::PRIORITY.iter().find_map(|convention| {
            let (r1_tag, _) = convention.tags();
            name.strip_suffix(&format!("{}.{}", r1_tag, READS_EXT))
                .filter(|base| !base.is_empty())
        })
    }

    fn is_canonical(&self) -> bool {
        matches!(self, PairingConvention::Numeric)
    }
}


/// Canonical read file name for a sample, `<name>_<read>.fastq.gz`.
pub fn canonical_read_name(sample: &str, read: u8) -> String {
    format!("{}_{}.{}", sample, read, READS_EXT)
}


#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub genome: ReferenceGenome,
    pub samples: Vec<Sample>,
}

impl Resolution {
    pub fn sample_names(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.name.clone()).collect()
    }
}


struct PendingPair<'a> {
    name: String,
    convention: PairingConvention,
    read1: &'a UploadedFile,
    read2: &'a UploadedFile,
}


/// Resolves an upload set into a reference genome and ordered samples.
/// Files after the genome is removed are paired strictly by upload order
/// (i, i+1). Nothing on disk changes unless every pair resolves.
///
/// # Arguments
///
/// * `files` - Uploaded files in upload order.
///
/// # Returns
/// Resolution, or the first resolution error.
pub fn resolve_uploads(files: &[UploadedFile]) -> Result<Resolution, PipelineError> {
    let genome_file = files
        .iter()
        .find(|f| f.is_genome())
        .ok_or(PipelineError::NoGenomeFound)?;
    let genome = ReferenceGenome::from_fasta(&genome_file.stored_path);
    debug!("Reference genome: {}", genome.fasta.display());

    let reads: Vec<&UploadedFile> = files
        .iter()
        .filter(|f| !std::ptr::eq(*f, genome_file))
        .collect();

    let pending = pair_reads(&reads)?;
    let samples = normalize_pairs(pending)?;

    info!(
        "Resolved {} sample(s): {}",
        samples.len(),
        samples.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    Ok(Resolution { genome, samples })
}


fn pair_reads<'a>(reads: &[&'a UploadedFile]) -> Result<Vec<PendingPair<'a>>, PipelineError> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut pending = Vec::with_capacity(reads.len() / 2);

    for chunk in reads.chunks(2) {
        let read1 = chunk[0];
        let read2 = chunk.get(1).copied().ok_or_else(|| PipelineError::MismatchedPair {
            first: read1.original_name.clone(),
            second: "<missing>".to_string(),
        })?;

        let matched = PairingConvention::PRIORITY.iter().find_map(|convention| {
            convention
                .match_pair(&read1.original_name, &read2.original_name)
                .map(|name| (name, *convention))
        });

        let (name, convention) = matched.ok_or_else(|| PipelineError::MismatchedPair {
            first: read1.original_name.clone(),
            second: read2.original_name.clone(),
        })?;

        validate_sample_name(&name)?;
        if !seen.insert(name.clone()) {
            return Err(PipelineError::DuplicateSample(name));
        }

        pending.push(PendingPair { name, convention, read1, read2 });
    }

    for read in pending.iter().flat_map(|p| [p.read1, p.read2]) {
        if !read.stored_path.is_file() {
            return Err(PipelineError::IOError(format!(
                "Uploaded file {} not found at {}",
                read.original_name,
                read.stored_path.display()
            )));
        }
    }

    Ok(pending)
}


fn validate_sample_name(name: &str) -> Result<(), PipelineError> {
    let valid = !name.starts_with('.')
        && name
            .chars()
            .all(|c| matches!(c, '0'..='9' | 'A'..='Z' | 'a'..='z' | '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidSampleName(name.to_string()))
    }
}


/// Builds the samples, renaming non-canonical reads in place. Every target
/// is checked before the first rename, and completed renames are undone if
/// a later one fails.
fn normalize_pairs(pending: Vec<PendingPair<'_>>) -> Result<Vec<Sample>, PipelineError> {
    let mut samples = Vec::with_capacity(pending.len());
    let mut renames: Vec<(PathBuf, PathBuf)> = Vec::new();

    for pair in pending {
        if pair.convention.is_canonical() {
            samples.push(Sample {
                name: pair.name,
                read1: pair.read1.stored_path.clone(),
                read2: pair.read2.stored_path.clone(),
            });
            continue;
        }

        let read1 = sibling(&pair.read1.stored_path, &canonical_read_name(&pair.name, 1));
        let read2 = sibling(&pair.read2.stored_path, &canonical_read_name(&pair.name, 2));
        for target in [&read1, &read2] {
            if target.exists() {
                return Err(PipelineError::IOError(format!(
                    "Cannot rename {} reads: {} already exists",
                    pair.name,
                    target.display()
                )));
            }
        }
        renames.push((pair.read1.stored_path.clone(), read1.clone()));
        renames.push((pair.read2.stored_path.clone(), read2.clone()));
        samples.push(Sample { name: pair.name, read1, read2 });
    }

    for (done, (from, to)) in renames.iter().enumerate() {
        if let Err(e) = fs::rename(from, to) {
            for (undo_from, undo_to) in renames[..done].iter().rev() {
                if let Err(undo_err) = fs::rename(undo_to, undo_from) {
                    warn!("Could not restore {}: {}", undo_from.display(), undo_err);
                }
            }
            return Err(PipelineError::IOError(format!(
                "Failed to rename {} to {}: {}",
                from.display(),
                to.display(),
                e
            )));
        }
        debug!("Renamed {} to {}", from.display(), to.display());
    }

    Ok(samples)
}


fn sibling(path: &Path, file_name: &str) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    }
}
