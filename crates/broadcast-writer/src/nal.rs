//! H.264 access unit handling for MP4 samples.
//!
//! Platform encoders hand over access units in Annex B form (NAL units split
//! by `00 00 01` / `00 00 00 01` start codes). MP4 samples carry the same NAL
//! units with a 4-byte big-endian length prefix instead, and keep SPS/PPS in
//! the track's sample description rather than in the stream.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// H.264 NAL unit types the MP4 path cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    Slice,
    IdrSlice,
    Sps,
    Pps,
    Delimiter,
    Other(u8),
}

impl NalUnitType {
    /// Type from the NAL header byte.
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::Slice,
            5 => Self::IdrSlice,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Delimiter,
            other => Self::Other(other),
        }
    }

    /// Carried in the sample description rather than in samples.
    fn is_out_of_band(self) -> bool {
        matches!(self, Self::Sps | Self::Pps | Self::Delimiter)
    }
}

/// A single NAL unit, header byte included, start code excluded.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_type: NalUnitType,
    pub data: Bytes,
}

/// SPS and PPS needed to describe an H.264 track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Bytes,
    pub pps: Bytes,
}

impl ParameterSets {
    /// An SPS shorter than 4 bytes has no profile/level to describe.
    pub fn is_usable(&self) -> bool {
        self.sps.len() >= 4 && !self.pps.is_empty()
    }
}

/// One access unit rewritten as an MP4 sample payload.
#[derive(Debug, Clone)]
pub struct SamplePayload {
    /// Length-prefixed slice data, parameter sets and delimiters removed.
    pub data: Bytes,

    /// Whether the access unit holds an IDR slice.
    pub contains_idr: bool,

    /// In-band parameter sets, if the access unit carried both.
    pub parameter_sets: Option<ParameterSets>,
}

/// Position and length of the next start code at or after `from`.
fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut pos = from;
    while pos + 3 <= data.len() {
        match data[pos..] {
            [0, 0, 1, ..] => return Some((pos, 3)),
            [0, 0, 0, 1, ..] => return Some((pos, 4)),
            _ => pos += 1,
        }
    }
    None
}

/// Split an Annex B byte stream into NAL units.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut nals = Vec::new();
    let mut next = next_start_code(data, 0);

    while let Some((pos, code_len)) = next {
        let body = pos + code_len;
        next = next_start_code(data, body);
        let end = next.map_or(data.len(), |(p, _)| p);

        if let Some(&header) = data.get(body).filter(|_| body < end) {
            nals.push(NalUnit {
                nal_type: NalUnitType::from_header(header),
                data: Bytes::copy_from_slice(&data[body..end]),
            });
        }
    }

    nals
}

/// Prefix every NAL unit with its 4-byte big-endian length.
pub fn length_prefixed(nals: &[NalUnit]) -> Bytes {
    let mut buf = BytesMut::with_capacity(nals.iter().map(|n| n.data.len() + 4).sum());

    for nal in nals {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }

    buf.freeze()
}

/// Find the last SPS and PPS in a list of NAL units.
pub fn find_parameter_sets(nals: &[NalUnit]) -> Option<ParameterSets> {
    let mut sps = None;
    let mut pps = None;

    for nal in nals {
        match nal.nal_type {
            NalUnitType::Sps => sps = Some(nal.data.clone()),
            NalUnitType::Pps => pps = Some(nal.data.clone()),
            _ => {}
        }
    }

    match (sps, pps) {
        (Some(sps), Some(pps)) => Some(ParameterSets { sps, pps }),
        _ => None,
    }
}

/// Drop NAL units that belong in the sample description, not the sample.
pub fn filter_parameter_sets(nals: Vec<NalUnit>) -> Vec<NalUnit> {
    nals.into_iter()
        .filter(|nal| !nal.nal_type.is_out_of_band())
        .collect()
}

/// Rewrite an Annex B access unit as an MP4 sample payload.
///
/// Input without any start code is assumed to be length-prefixed already and
/// is passed through untouched.
pub fn annex_b_to_sample(data: &Bytes) -> SamplePayload {
    let nals = parse_annex_b(data);
    if nals.is_empty() {
        return SamplePayload {
            data: data.clone(),
            contains_idr: false,
            parameter_sets: None,
        };
    }

    let parameter_sets = find_parameter_sets(&nals);
    let contains_idr = nals.iter().any(|n| n.nal_type == NalUnitType::IdrSlice);
    let slices = filter_parameter_sets(nals);

    trace!(
        nal_count = slices.len(),
        contains_idr,
        has_parameter_sets = parameter_sets.is_some(),
        "Converted access unit"
    );

    SamplePayload {
        data: length_prefixed(&slices),
        contains_idr,
        parameter_sets,
    }
}
