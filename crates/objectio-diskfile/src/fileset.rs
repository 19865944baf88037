//! Fileset resolution
//!
//! A hash directory holds every surviving generation of one object as
//! immutable, timestamp-named files. Resolution turns a raw listing into the
//! authoritative view:
//!
//! - at most one of `data_file` / `ts_file`
//! - `meta_file` only alongside a `data_file`
//! - an obsolete list, safe to unlink now
//! - a possible-reclaim list, safe to unlink once older than the reclaim age
//!
//! The base algorithm is fixed. A [`FilesetLayout`] supplies the parts that
//! differ between storage policy kinds: filename grammar and the choice of
//! which data file is authoritative.

use objectio_common::{Error, Result, Timestamp};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Extension of object data files
pub const DATA_EXT: &str = ".data";
/// Extension of metadata overlay files
pub const META_EXT: &str = ".meta";
/// Extension of tombstones
pub const TOMBSTONE_EXT: &str = ".ts";
/// Extension of erasure-coded durable markers
pub const DURABLE_EXT: &str = ".durable";

/// Kind of an on-disk file, ordered by precedence at equal timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    Data,
    Durable,
    Meta,
    Tombstone,
}

impl FileKind {
    /// Filename extension including the dot
    #[must_use]
    pub const fn ext(self) -> &'static str {
        match self {
            Self::Data => DATA_EXT,
            Self::Durable => DURABLE_EXT,
            Self::Meta => META_EXT,
            Self::Tombstone => TOMBSTONE_EXT,
        }
    }
}

/// One parsed file from a hash directory listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnDiskFile {
    pub filename: String,
    pub timestamp: Timestamp,
    pub kind: FileKind,
    /// Fragment index, erasure-coded data files only
    pub frag_index: Option<u32>,
}

impl OnDiskFile {
    /// Listing order: newest first, then by kind precedence, then by name
    fn precedence(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.kind.cmp(&self.kind))
            .then_with(|| self.filename.cmp(&other.filename))
    }
}

/// File category consulted when deciding whether cleanup may unlink a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimCategory {
    /// Superseded by a newer file
    Obsolete,
    /// The authoritative tombstone
    Tombstone,
    /// Not authoritative, but possibly still needed by a peer
    PossibleReclaim,
}

/// Working state handed to a layout's data selection hook
#[derive(Debug, Default)]
pub struct Candidates {
    /// Data files newer than any tombstone, newest first
    pub data: Vec<OnDiskFile>,
    /// Durable markers newer than any tombstone, newest first
    pub durables: Vec<OnDiskFile>,
    /// Fragment index requested by the caller
    pub frag_index: Option<u32>,
}

/// Outcome of a layout's data selection hook
#[derive(Debug, Default)]
pub struct Selection {
    pub data_file: Option<OnDiskFile>,
    pub durable_file: Option<OnDiskFile>,
    pub obsolete: Vec<OnDiskFile>,
    pub possible_reclaim: Vec<OnDiskFile>,
    /// Files that are valid but not part of this fileset (other fragments)
    pub retained: Vec<OnDiskFile>,
}

/// Layout-specific rules plugged into fileset resolution
pub trait FilesetLayout: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Parse a filename, rejecting anything this layout never writes
    fn parse_filename(&self, filename: &str) -> Result<OnDiskFile>;

    /// Filename for a committed data file
    fn data_filename(&self, timestamp: &Timestamp, frag_index: Option<u32>) -> Result<String>;

    /// Whether a commit must also write a `.durable` marker
    fn writes_durable(&self) -> bool {
        false
    }

    /// Choose the authoritative data file among the candidates
    fn select_data(&self, candidates: Candidates) -> Selection;

    /// Whether cleanup may unlink a file of this category at this age
    fn is_reclaimable(&self, category: ReclaimCategory, age: Duration, reclaim_age: Duration) -> bool {
        match category {
            ReclaimCategory::Obsolete => true,
            ReclaimCategory::Tombstone | ReclaimCategory::PossibleReclaim => age > reclaim_age,
        }
    }
}

/// Resolved view of one hash directory
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fileset {
    pub data_file: Option<OnDiskFile>,
    pub meta_file: Option<OnDiskFile>,
    pub ts_file: Option<OnDiskFile>,
    pub durable_file: Option<OnDiskFile>,
    pub obsolete: Vec<OnDiskFile>,
    pub possible_reclaim: Vec<OnDiskFile>,
    /// Filenames that did not parse
    pub unexpected: Vec<String>,
}

impl Fileset {
    /// Whether the directory holds neither data nor a tombstone
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data_file.is_none() && self.ts_file.is_none()
    }

    fn check_invariant(&self) -> Result<()> {
        let valid = match (&self.data_file, &self.meta_file, &self.ts_file) {
            (None, None, None) | (None, None, Some(_)) => true,
            (Some(_), _, None) => true,
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "invalid fileset: data={:?} meta={:?} ts={:?}",
                self.data_file.as_ref().map(|f| &f.filename),
                self.meta_file.as_ref().map(|f| &f.filename),
                self.ts_file.as_ref().map(|f| &f.filename),
            )))
        }
    }
}

/// Resolve a hash directory listing into its authoritative fileset.
///
/// The result does not depend on listing order. Unparseable names are
/// logged and reported in `unexpected`; they are never deleted.
pub fn resolve<S: AsRef<str>>(
    layout: &dyn FilesetLayout,
    filenames: &[S],
    frag_index: Option<u32>,
) -> Result<Fileset> {
    let mut fileset = Fileset::default();
    let mut files = Vec::with_capacity(filenames.len());

    for name in filenames {
        let name = name.as_ref();
        match layout.parse_filename(name) {
            Ok(file) => files.push(file),
            Err(e) => {
                warn!("Unexpected file in {} layout: {}", layout.name(), e);
                fileset.unexpected.push(name.to_string());
            }
        }
    }
    files.sort_by(OnDiskFile::precedence);
    files.dedup_by(|a, b| a.filename == b.filename);

    let mut tombstones = Vec::new();
    let mut metas = Vec::new();
    let mut candidates = Candidates {
        frag_index,
        ..Candidates::default()
    };
    for file in files {
        match file.kind {
            FileKind::Tombstone => tombstones.push(file),
            FileKind::Meta => metas.push(file),
            FileKind::Data => candidates.data.push(file),
            FileKind::Durable => candidates.durables.push(file),
        }
    }

    // Only the newest tombstone counts; it invalidates everything at or
    // before its own time
    let mut tombstones = tombstones.into_iter();
    fileset.ts_file = tombstones.next();
    fileset.obsolete.extend(tombstones);
    if let Some(ts) = &fileset.ts_file {
        let deleted = |f: &OnDiskFile| f.timestamp <= ts.timestamp;
        for list in [&mut metas, &mut candidates.data, &mut candidates.durables] {
            let (gone, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(deleted);
            fileset.obsolete.extend(gone);
            *list = kept;
        }
    }

    let mut metas = metas.into_iter();
    let newest_meta = metas.next();
    fileset.obsolete.extend(metas);

    let selection = layout.select_data(candidates);
    fileset.obsolete.extend(selection.obsolete);
    fileset.possible_reclaim.extend(selection.possible_reclaim);
    fileset.data_file = selection.data_file;
    fileset.durable_file = selection.durable_file;

    if fileset.data_file.is_some() {
        // Data newer than the tombstone resurrects the object
        fileset.obsolete.extend(fileset.ts_file.take());
    }

    if let Some(meta) = newest_meta {
        match &fileset.data_file {
            Some(data) if meta.timestamp < data.timestamp => fileset.obsolete.push(meta),
            Some(_) => fileset.meta_file = Some(meta),
            None => fileset.possible_reclaim.push(meta),
        }
    }

    fileset.check_invariant()?;
    Ok(fileset)
}

fn split_ext(filename: &str) -> Result<(&str, &str)> {
    filename
        .rfind('.')
        .filter(|&i| i > 0)
        .map(|i| filename.split_at(i))
        .ok_or_else(|| Error::InvalidFilename(filename.to_string()))
}

fn parse_timestamp(stem: &str, filename: &str) -> Result<Timestamp> {
    stem.parse()
        .map_err(|_| Error::InvalidFilename(filename.to_string()))
}

/// Whole-object replicas: `<ts>.data`, `<ts>.meta`, `<ts>.ts`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicatedLayout;

impl FilesetLayout for ReplicatedLayout {
    fn name(&self) -> &'static str {
        "replicated"
    }

    fn parse_filename(&self, filename: &str) -> Result<OnDiskFile> {
        let (stem, ext) = split_ext(filename)?;
        let kind = match ext {
            DATA_EXT => FileKind::Data,
            META_EXT => FileKind::Meta,
            TOMBSTONE_EXT => FileKind::Tombstone,
            _ => return Err(Error::InvalidFilename(filename.to_string())),
        };
        Ok(OnDiskFile {
            filename: filename.to_string(),
            timestamp: parse_timestamp(stem, filename)?,
            kind,
            frag_index: None,
        })
    }

    fn data_filename(&self, timestamp: &Timestamp, _frag_index: Option<u32>) -> Result<String> {
        Ok(format!("{}{DATA_EXT}", timestamp.internal()))
    }

    fn select_data(&self, candidates: Candidates) -> Selection {
        let mut data = candidates.data.into_iter();
        Selection {
            data_file: data.next(),
            obsolete: data.collect(),
            possible_reclaim: candidates.durables,
            ..Selection::default()
        }
    }
}

/// Erasure-coded fragments: `<ts>#<frag>.data` made visible by `<ts>.durable`
#[derive(Debug, Clone, Copy, Default)]
pub struct ErasureCodedLayout;

impl FilesetLayout for ErasureCodedLayout {
    fn name(&self) -> &'static str {
        "erasure_coded"
    }

    fn parse_filename(&self, filename: &str) -> Result<OnDiskFile> {
        let (stem, ext) = split_ext(filename)?;
        let (kind, stem, frag_index) = match ext {
            DATA_EXT => {
                let (ts, frag) = stem
                    .split_once('#')
                    .ok_or_else(|| Error::InvalidFilename(filename.to_string()))?;
                let frag = frag
                    .parse::<u32>()
                    .map_err(|_| Error::InvalidFilename(filename.to_string()))?;
                (FileKind::Data, ts, Some(frag))
            }
            DURABLE_EXT => (FileKind::Durable, stem, None),
            META_EXT => (FileKind::Meta, stem, None),
            TOMBSTONE_EXT => (FileKind::Tombstone, stem, None),
            _ => return Err(Error::InvalidFilename(filename.to_string())),
        };
        Ok(OnDiskFile {
            filename: filename.to_string(),
            timestamp: parse_timestamp(stem, filename)?,
            kind,
            frag_index,
        })
    }

    fn data_filename(&self, timestamp: &Timestamp, frag_index: Option<u32>) -> Result<String> {
        let frag = frag_index.ok_or_else(|| {
            Error::invalid_argument("fragment index required for erasure-coded data")
        })?;
        Ok(format!("{}#{frag}{DATA_EXT}", timestamp.internal()))
    }

    fn writes_durable(&self) -> bool {
        true
    }

    fn select_data(&self, candidates: Candidates) -> Selection {
        let mut selection = Selection::default();
        let mut durables = candidates.durables.into_iter();
        let Some(durable) = durables.next() else {
            // Nothing committed: every fragment may still be mid-PUT
            selection.possible_reclaim = candidates.data;
            return selection;
        };
        selection.obsolete.extend(durables);

        let mut at_durable = Vec::new();
        for file in candidates.data {
            match file.timestamp.cmp(&durable.timestamp) {
                Ordering::Greater => selection.possible_reclaim.push(file),
                Ordering::Equal => at_durable.push(file),
                Ordering::Less => selection.obsolete.push(file),
            }
        }

        let chosen = match candidates.frag_index {
            Some(wanted) => at_durable.iter().position(|f| f.frag_index == Some(wanted)),
            None if at_durable.is_empty() => None,
            None => Some(0),
        };
        if let Some(i) = chosen {
            selection.data_file = Some(at_durable.remove(i));
            selection.durable_file = Some(durable);
        } else if at_durable.is_empty() {
            // Marker without any fragment to commit
            selection.possible_reclaim.push(durable);
        } else {
            selection.durable_file = Some(durable);
        }
        selection.retained = at_durable;
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn names(files: &[OnDiskFile]) -> Vec<&str> {
        let mut names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn filename(file: &Option<OnDiskFile>) -> Option<&str> {
        file.as_ref().map(|f| f.filename.as_str())
    }

    #[test]
    fn test_data_and_newer_meta() {
        let set = resolve(&ReplicatedLayout, &["1000.data", "1001.meta"], None).unwrap();
        assert_eq!(filename(&set.data_file), Some("1000.data"));
        assert_eq!(filename(&set.meta_file), Some("1001.meta"));
        assert!(set.ts_file.is_none());
        assert!(set.obsolete.is_empty());
    }

    #[test]
    fn test_tombstone_supersedes_older_data() {
        let set = resolve(&ReplicatedLayout, &["1000.data", "2000.ts", "1500.meta"], None).unwrap();
        assert!(set.data_file.is_none());
        assert!(set.meta_file.is_none());
        assert_eq!(filename(&set.ts_file), Some("2000.ts"));
        assert_eq!(names(&set.obsolete), vec!["1000.data", "1500.meta"]);
    }

    #[test]
    fn test_data_newer_than_tombstone() {
        let set = resolve(&ReplicatedLayout, &["1000.ts", "2000.data"], None).unwrap();
        assert_eq!(filename(&set.data_file), Some("2000.data"));
        assert!(set.ts_file.is_none());
        assert_eq!(names(&set.obsolete), vec!["1000.ts"]);
    }

    #[test]
    fn test_equal_timestamp_tombstone_wins() {
        let set = resolve(&ReplicatedLayout, &["1000.data", "1000.ts"], None).unwrap();
        assert!(set.data_file.is_none());
        assert_eq!(filename(&set.ts_file), Some("1000.ts"));
        assert_eq!(names(&set.obsolete), vec!["1000.data"]);
    }

    #[test]
    fn test_meta_at_data_timestamp_is_kept() {
        let set = resolve(&ReplicatedLayout, &["1000.data", "1000.meta"], None).unwrap();
        assert_eq!(filename(&set.meta_file), Some("1000.meta"));
    }

    #[test]
    fn test_meta_older_than_data_is_obsolete() {
        let set = resolve(
            &ReplicatedLayout,
            &["0000000900.00000.meta", "1000.data", "0000000800.00000.data"],
            None,
        )
        .unwrap();
        assert_eq!(filename(&set.data_file), Some("1000.data"));
        assert!(set.meta_file.is_none());
        assert_eq!(
            names(&set.obsolete),
            vec!["0000000800.00000.data", "0000000900.00000.meta"]
        );
    }

    #[test]
    fn test_lone_meta_is_possible_reclaim() {
        let set = resolve(&ReplicatedLayout, &["1000.meta", "999.meta"], None).unwrap();
        assert!(set.is_empty());
        assert!(set.meta_file.is_none());
        assert_eq!(names(&set.possible_reclaim), vec!["1000.meta"]);
        assert_eq!(names(&set.obsolete), vec!["999.meta"]);
    }

    #[test]
    fn test_unexpected_files_are_skipped() {
        let set = resolve(&ReplicatedLayout, &["1000.data", "junk", "abc.data", "1000.durable"], None)
            .unwrap();
        assert_eq!(filename(&set.data_file), Some("1000.data"));
        let mut unexpected = set.unexpected.clone();
        unexpected.sort();
        assert_eq!(unexpected, vec!["1000.durable", "abc.data", "junk"]);
        assert!(set.obsolete.is_empty());
    }

    #[test]
    fn test_empty_listing() {
        let empty: [&str; 0] = [];
        let set = resolve(&ReplicatedLayout, &empty, None).unwrap();
        assert_eq!(set, Fileset::default());
    }

    #[test]
    fn test_resolution_ignores_listing_order() {
        let mut listing = vec![
            "1000.data",
            "1001.data",
            "1002.meta",
            "1003.meta",
            "0999.ts",
            "1001.ts",
            "1004.data",
        ];
        let expected = resolve(&ReplicatedLayout, &listing, None).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            listing.shuffle(&mut rng);
            let mut set = resolve(&ReplicatedLayout, &listing, None).unwrap();
            set.obsolete.sort_by(|a, b| a.filename.cmp(&b.filename));
            let mut want = expected.clone();
            want.obsolete.sort_by(|a, b| a.filename.cmp(&b.filename));
            assert_eq!(set, want);
        }
        assert_eq!(filename(&expected.data_file), Some("1004.data"));
        assert!(expected.meta_file.is_none());
    }

    #[test]
    fn test_ec_durable_selects_fragment() {
        let listing = ["1000#0.data", "1000#2.data", "1000.durable", "0900#2.data", "0800.durable"];
        let set = resolve(&ErasureCodedLayout, &listing, Some(2)).unwrap();
        assert_eq!(filename(&set.data_file), Some("1000#2.data"));
        assert_eq!(filename(&set.durable_file), Some("1000.durable"));
        assert_eq!(names(&set.obsolete), vec!["0800.durable", "0900#2.data"]);
        assert!(set.possible_reclaim.is_empty());

        let any = resolve(&ErasureCodedLayout, &listing, None).unwrap();
        assert_eq!(filename(&any.data_file), Some("1000#0.data"));
    }

    #[test]
    fn test_ec_missing_fragment_is_absent() {
        let set = resolve(&ErasureCodedLayout, &["1000#0.data", "1000.durable"], Some(3)).unwrap();
        assert!(set.data_file.is_none());
        assert!(set.obsolete.is_empty());
        assert!(set.possible_reclaim.is_empty());
    }

    #[test]
    fn test_ec_non_durable_fragments_are_possible_reclaim() {
        let set = resolve(&ErasureCodedLayout, &["1000#1.data", "2000#1.data"], None).unwrap();
        assert!(set.data_file.is_none());
        assert_eq!(names(&set.possible_reclaim), vec!["1000#1.data", "2000#1.data"]);

        let set = resolve(
            &ErasureCodedLayout,
            &["1000#1.data", "1000.durable", "2000#1.data"],
            Some(1),
        )
        .unwrap();
        assert_eq!(filename(&set.data_file), Some("1000#1.data"));
        assert_eq!(names(&set.possible_reclaim), vec!["2000#1.data"]);
    }

    #[test]
    fn test_ec_rejects_unfragmented_data() {
        assert!(ErasureCodedLayout.parse_filename("1000.data").is_err());
        assert!(ErasureCodedLayout.parse_filename("1000#x.data").is_err());
        let file = ErasureCodedLayout.parse_filename("1000#7.data").unwrap();
        assert_eq!(file.frag_index, Some(7));
    }

    #[test]
    fn test_data_filenames() {
        let ts: Timestamp = "1000".parse().unwrap();
        assert_eq!(
            ReplicatedLayout.data_filename(&ts, None).unwrap(),
            "0000001000.00000.data"
        );
        assert_eq!(
            ErasureCodedLayout.data_filename(&ts, Some(4)).unwrap(),
            "0000001000.00000#4.data"
        );
        assert!(ErasureCodedLayout.data_filename(&ts, None).is_err());
    }

    #[test]
    fn test_default_reclaim_predicate() {
        let week = Duration::from_secs(604_800);
        let layout = ReplicatedLayout;
        assert!(layout.is_reclaimable(ReclaimCategory::Obsolete, Duration::ZERO, week));
        assert!(!layout.is_reclaimable(ReclaimCategory::Tombstone, Duration::from_secs(60), week));
        assert!(layout.is_reclaimable(ReclaimCategory::Tombstone, week * 2, week));
        assert!(!layout.is_reclaimable(ReclaimCategory::PossibleReclaim, week, week));
    }
}
