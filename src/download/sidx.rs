//! Segment index (`sidx`) parsing for time-range clips of dash streams.
//!
//! A dash stream carries an initialization range and an index range. The
//! index range holds a `sidx` box listing every subsegment's byte size and
//! duration, which is enough to fetch only the subsegments overlapping a
//! time window.

use crate::units::TimeRange;

/// Byte ranges of a dash stream's initialization and index sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBase {
    /// Initialization section, inclusive.
    pub initialization: (u64, u64),
    /// Index section holding the `sidx` box, inclusive.
    pub index_range: (u64, u64),
}

impl SegmentBase {
    /// Parses the `"start-end"` strings served by the site.
    ///
    /// ```
    /// use mediadl_core::download::SegmentBase;
    ///
    /// let base = SegmentBase::parse("0-907", "908-1695").unwrap();
    /// assert_eq!(base.index_range, (908, 1695));
    /// assert!(SegmentBase::parse("0-907", "oops").is_none());
    /// ```
    #[must_use]
    pub fn parse(initialization: &str, index_range: &str) -> Option<Self> {
        Some(Self {
            initialization: parse_span(initialization)?,
            index_range: parse_span(index_range)?,
        })
    }
}

fn parse_span(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    (start <= end).then_some((start, end))
}

/// One entry of a segment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidxReference {
    /// Points at another `sidx` box rather than media.
    pub is_index: bool,
    /// Size of the referenced subsegment in bytes.
    pub size: u32,
    /// Duration in timescale units.
    pub duration: u32,
}

/// A parsed `sidx` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIndex {
    /// Units per second of [`SidxReference::duration`].
    pub timescale: u32,
    /// Gap between the end of the index section and the first subsegment.
    pub first_offset: u64,
    /// Subsegments in file order.
    pub references: Vec<SidxReference>,
}

/// Byte ranges covering a time window and where the window starts in them.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipRanges {
    /// Initialization range followed by every overlapping subsegment.
    pub ranges: Vec<(u64, u64)>,
    /// Seconds from the first fetched subsegment to the window start.
    pub lead: f64,
}

impl ClipRanges {
    /// Total bytes across all ranges.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start + 1).sum()
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(format!("truncated at byte {}", self.pos));
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, String> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }
}

/// Finds and parses the first `sidx` box in `data`.
///
/// # Errors
///
/// Returns a description of the problem when no `sidx` box is present or
/// the box is truncated.
pub fn parse_sidx(data: &[u8]) -> Result<SegmentIndex, String> {
    let mut reader = Reader::new(data);
    while reader.pos < data.len() {
        let box_start = reader.pos;
        let size = u64::from(reader.u32()?);
        let kind = reader.take(4)?;
        let size = match size {
            1 => reader.u64()?,
            0 => (data.len() - box_start) as u64,
            size => size,
        };
        if kind == b"sidx" {
            let end = usize::try_from(size)
                .ok()
                .and_then(|size| box_start.checked_add(size))
                .map_or(data.len(), |end| end.min(data.len()));
            return parse_sidx_body(&data[reader.pos..end]);
        }
        reader.pos = usize::try_from(size)
            .ok()
            .and_then(|size| box_start.checked_add(size))
            .filter(|&next| next > box_start)
            .ok_or_else(|| format!("bad box size {size} at byte {box_start}"))?;
    }
    Err("no sidx box".to_string())
}

fn parse_sidx_body(body: &[u8]) -> Result<SegmentIndex, String> {
    let mut reader = Reader::new(body);
    let version = reader.take(4)?[0];
    let _reference_id = reader.u32()?;
    let timescale = reader.u32()?;
    let first_offset = if version == 0 {
        let _earliest = reader.u32()?;
        u64::from(reader.u32()?)
    } else {
        let _earliest = reader.u64()?;
        reader.u64()?
    };
    let _reserved = reader.u16()?;
    let count = reader.u16()?;
    let references = (0..count)
        .map(|_| {
            let word = reader.u32()?;
            let duration = reader.u32()?;
            let _sap = reader.u32()?;
            Ok(SidxReference {
                is_index: word & 0x8000_0000 != 0,
                size: word & 0x7fff_ffff,
                duration,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    if timescale == 0 {
        return Err("zero timescale".to_string());
    }
    Ok(SegmentIndex {
        timescale,
        first_offset,
        references,
    })
}

/// Selects the subsegments of `index` overlapping `range`.
///
/// Subsegments start right after the index section of `base`. The first
/// selected subsegment is the one containing `range.start`; selection stops
/// at the first subsegment starting after `range.end`. Returns `None` when
/// nothing overlaps.
#[must_use]
pub fn clip_ranges(
    index: &SegmentIndex,
    base: &SegmentBase,
    range: TimeRange,
) -> Option<ClipRanges> {
    let mut ranges = vec![base.initialization];
    let mut elapsed = 0.0;
    let mut offset = base.index_range.1 + 1 + index.first_offset;
    let mut lead = None;
    for reference in index.references.iter().filter(|r| !r.is_index) {
        let duration = f64::from(reference.duration) / f64::from(index.timescale);
        if lead.is_none() && range.start < elapsed + duration {
            lead = Some(range.start - elapsed);
        }
        if lead.is_some() {
            if range.end < elapsed {
                break;
            }
            if reference.size > 0 {
                ranges.push((offset, offset + u64::from(reference.size) - 1));
            }
        }
        elapsed += duration;
        offset += u64::from(reference.size);
    }
    Some(ClipRanges {
        ranges,
        lead: lead?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// A version 0 `sidx` box with one media reference per `(size, duration)`.
    fn sidx_box(timescale: u32, first_offset: u32, refs: &[(u32, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&timescale.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&first_offset.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&u16::try_from(refs.len()).unwrap().to_be_bytes());
        for (size, duration) in refs {
            body.extend_from_slice(&size.to_be_bytes());
            body.extend_from_slice(&duration.to_be_bytes());
            body.extend_from_slice(&0x9000_0000u32.to_be_bytes());
        }
        let mut out = Vec::new();
        out.extend_from_slice(&u32::try_from(body.len() + 8).unwrap().to_be_bytes());
        out.extend_from_slice(b"sidx");
        out.extend_from_slice(&body);
        out
    }

    fn base() -> SegmentBase {
        SegmentBase::parse("0-99", "100-199").unwrap()
    }

    #[test]
    fn test_parse_sidx_reads_references() {
        let index = parse_sidx(&sidx_box(1000, 0, &[(300, 4000), (500, 5000)])).unwrap();
        assert_eq!(index.timescale, 1000);
        assert_eq!(index.references.len(), 2);
        assert_eq!(index.references[1], SidxReference {
            is_index: false,
            size: 500,
            duration: 5000,
        });
    }

    #[test]
    fn test_parse_sidx_skips_leading_boxes() {
        let mut data = vec![0, 0, 0, 12];
        data.extend_from_slice(b"free");
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend(sidx_box(90_000, 0, &[(10, 90_000)]));
        let index = parse_sidx(&data).unwrap();
        assert_eq!(index.references.len(), 1);
    }

    #[test]
    fn test_parse_sidx_rejects_missing_or_truncated_box() {
        assert!(parse_sidx(b"").is_err());
        let mut data = vec![0, 0, 0, 8];
        data.extend_from_slice(b"moov");
        assert_eq!(parse_sidx(&data).unwrap_err(), "no sidx box");
        let mut cut = sidx_box(1000, 0, &[(300, 4000)]);
        cut.truncate(cut.len() - 6);
        assert!(parse_sidx(&cut).is_err());
    }

    #[test]
    fn test_clip_ranges_pick_overlapping_subsegments() {
        // Subsegments cover [0,4) [4,8) [8,12) [12,16) seconds.
        let index = parse_sidx(&sidx_box(1, 0, &[(10, 4), (20, 4), (30, 4), (40, 4)])).unwrap();
        let clip = clip_ranges(&index, &base(), TimeRange { start: 5.0, end: 9.0 }).unwrap();
        assert_eq!(clip.ranges, vec![(0, 99), (210, 229), (230, 259)]);
        assert!((clip.lead - 1.0).abs() < 1e-9);
        assert_eq!(clip.total(), 100 + 20 + 30);
    }

    #[test]
    fn test_clip_ranges_honor_first_offset_and_reject_late_windows() {
        let index = parse_sidx(&sidx_box(2, 8, &[(10, 4), (20, 4)])).unwrap();
        let clip = clip_ranges(&index, &base(), TimeRange { start: 0.0, end: 1.0 }).unwrap();
        assert_eq!(clip.ranges, vec![(0, 99), (208, 217)]);
        assert!(clip_ranges(&index, &base(), TimeRange { start: 4.0, end: 6.0 }).is_none());
    }

    #[test]
    fn test_segment_base_rejects_reversed_spans() {
        assert!(SegmentBase::parse("10-5", "0-1").is_none());
        assert_eq!(SegmentBase::parse(" 0-9 ", "10-19").unwrap().initialization, (0, 9));
    }
}
