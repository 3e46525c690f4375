// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HVCC container helpers.
//!
//! Demuxed HEVC samples come with an HEVCDecoderConfigurationRecord
//! ("extradata") describing the track and, usually, carrying its parameter
//! sets out of band. This module locates NAL units inside such a record,
//! classifies samples as keyframes, and can synthesize a record from the
//! parameter sets found in band in a sample.

use std::io::Cursor;

use anyhow::anyhow;
use byteorder::BigEndian;
use byteorder::WriteBytesExt;
use bytes::Buf;
use log::debug;

use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::Vps;

/// Offset of the byte whose two low bits hold lengthSizeMinusOne.
const NAL_LENGTH_SIZE_OFFSET: usize = 21;
/// Size of the fixed part of an HEVCDecoderConfigurationRecord, up to and
/// excluding numOfArrays.
const HVCC_HEADER_SIZE: usize = 22;

/// A demuxed HEVC sample together with its track's extradata.
#[derive(Clone, Copy, Debug)]
pub struct Sample<'a> {
    /// The sample payload: a sequence of length-prefixed NAL units.
    pub data: &'a [u8],
    /// The HEVCDecoderConfigurationRecord of the sample's track.
    pub extradata: &'a [u8],
    /// Number of plaintext bytes at the start of `data` when the sample is
    /// partially encrypted, `None` for clear samples. Only this prefix is
    /// scanned for in-band parameter sets.
    pub clear_prefix: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    IFrame,
    Other,
    Invalid,
}

/// Whether `sample` is plausibly HVCC-wrapped: a non-degenerate payload
/// described by an extradata blob large enough to hold a configuration
/// record.
pub fn is_hvcc(sample: &Sample) -> bool {
    sample.data.len() >= 3 && sample.extradata.len() > HVCC_HEADER_SIZE
}

/// Whether `extradata` carries at least one parameter set array.
pub fn has_param_sets(extradata: &[u8]) -> bool {
    extradata.len() > HVCC_HEADER_SIZE && extradata[HVCC_HEADER_SIZE] > 0
}

/// The NAL unit length prefix size used by samples of this track, in
/// bytes (1 to 4). `None` if `extradata` is too short to be a
/// configuration record.
pub fn nal_length_size(extradata: &[u8]) -> Option<usize> {
    let b = extradata.get(NAL_LENGTH_SIZE_OFFSET)?;
    Some(usize::from(b & 0x3) + 1)
}

/// Returns the first NAL unit of type `type_` in the parameter set arrays
/// of `extradata`, without its length prefix. `None` if there is no such
/// NAL unit or the record is malformed.
pub fn find_nalu(extradata: &[u8], type_: NaluType) -> Option<&[u8]> {
    if extradata.len() <= HVCC_HEADER_SIZE {
        return None;
    }

    let mut r = Cursor::new(extradata);
    r.advance(HVCC_HEADER_SIZE);

    let num_arrays = r.get_u8();
    for _ in 0..num_arrays {
        if r.remaining() < 3 {
            return None;
        }
        let nalu_type = r.get_u8() & 0x3f;
        let num_nalus = r.get_u16();

        for _ in 0..num_nalus {
            if r.remaining() < 2 {
                return None;
            }
            let len = usize::from(r.get_u16());
            if r.remaining() < len {
                return None;
            }

            let offset = r.position() as usize;
            if nalu_type == type_ as u8 {
                return Some(&extradata[offset..offset + len]);
            }
            r.advance(len);
        }
    }

    None
}

/// Parses the first VPS found in `extradata`.
pub fn vps_from_extradata(extradata: &[u8]) -> anyhow::Result<Vps> {
    let nalu = find_nalu(extradata, NaluType::VpsNut).ok_or(anyhow!("no VPS in extradata"))?;
    Vps::parse(nalu)
}

/// Parses the first SPS found in `extradata`.
pub fn sps_from_extradata(extradata: &[u8]) -> anyhow::Result<Sps> {
    let nalu = find_nalu(extradata, NaluType::SpsNut).ok_or(anyhow!("no SPS in extradata"))?;
    Sps::parse(nalu)
}

/// Classifies `sample` by walking its length-prefixed NAL units: a sample
/// containing any IRAP NAL unit is a keyframe. Samples that are not
/// HVCC-wrapped, or whose length prefixes overrun the payload, are
/// [`FrameType::Invalid`].
pub fn frame_type(sample: &Sample) -> FrameType {
    if !is_hvcc(sample) {
        return FrameType::Invalid;
    }

    let nal_length_size = match nal_length_size(sample.extradata) {
        Some(size) => size,
        None => return FrameType::Invalid,
    };
    let mut r = Cursor::new(sample.data);
    while r.remaining() >= nal_length_size {
        let nal_len = r.get_uint(nal_length_size) as usize;
        if nal_len == 0 {
            continue;
        }
        if r.remaining() < nal_len {
            return FrameType::Invalid;
        }

        let nalu_type = (sample.data[r.position() as usize] >> 1) & 0x3f;
        if NaluType::n(nalu_type).is_some_and(|t| t.is_irap()) {
            return FrameType::IFrame;
        }
        r.advance(nal_len);
    }

    FrameType::Other
}

/// Synthesizes an HEVCDecoderConfigurationRecord from the parameter sets
/// found in band in `sample`, for streams whose track-level extradata has
/// none. Fails unless at least one valid VPS and one valid SPS are found;
/// invalid parameter sets are skipped, and PPS NAL units are copied without
/// validation.
///
/// The min_spatial_segmentation_idc, parallelismType and frame rate fields
/// of the record are left at their "unspecified" values.
pub fn extract_extradata(sample: &Sample) -> anyhow::Result<Vec<u8>> {
    if !is_hvcc(sample) {
        return Err(anyhow!("not an HVCC sample"));
    }

    let data = match sample.clear_prefix {
        Some(clear) => sample
            .data
            .get(..clear)
            .ok_or(anyhow!("clear prefix larger than sample"))?,
        None => sample.data,
    };

    let nal_length_size =
        nal_length_size(sample.extradata).ok_or(anyhow!("extradata too short"))?;

    let mut vps_data: Vec<u8> = vec![];
    let mut sps_data: Vec<u8> = vec![];
    let mut pps_data: Vec<u8> = vec![];
    let mut num_vps: u16 = 0;
    let mut num_sps: u16 = 0;
    let mut num_pps: u16 = 0;
    let mut chroma_format_idc = 0u8;
    let mut bit_depth_luma_minus8 = 0u8;
    let mut bit_depth_chroma_minus8 = 0u8;

    let mut r = Cursor::new(data);
    while r.remaining() > nal_length_size {
        let nal_len = r.get_uint(nal_length_size) as usize;
        if nal_len == 0 {
            continue;
        }
        if r.remaining() < nal_len || nal_len > usize::from(u16::MAX) {
            break;
        }

        let offset = r.position() as usize;
        let nalu = &data[offset..offset + nal_len];
        r.advance(nal_len);

        let nalu_type = (nalu[0] >> 1) & 0x3f;
        match NaluType::n(nalu_type) {
            Some(NaluType::VpsNut) => {
                if let Err(err) = Vps::parse(nalu) {
                    debug!("skipping invalid in-band VPS: {:#}", err);
                    continue;
                }
                num_vps += 1;
                vps_data.write_u16::<BigEndian>(nal_len as u16)?;
                vps_data.extend_from_slice(nalu);
            }
            Some(NaluType::SpsNut) => {
                let sps = match Sps::parse(nalu) {
                    Ok(sps) => sps,
                    Err(err) => {
                        debug!("skipping invalid in-band SPS: {:#}", err);
                        continue;
                    }
                };
                chroma_format_idc = sps.chroma_format_idc as u8;
                bit_depth_luma_minus8 = (sps.bit_depth_luma - 8) as u8;
                bit_depth_chroma_minus8 = (sps.bit_depth_chroma - 8) as u8;
                num_sps += 1;
                sps_data.write_u16::<BigEndian>(nal_len as u16)?;
                sps_data.extend_from_slice(nalu);
            }
            Some(NaluType::PpsNut) => {
                num_pps += 1;
                pps_data.write_u16::<BigEndian>(nal_len as u16)?;
                pps_data.extend_from_slice(nalu);
            }
            _ => (),
        }
    }

    if num_vps == 0 || num_sps == 0 {
        return Err(anyhow!("no usable parameter sets in sample"));
    }

    // The general_profile_space .. general_level_idc fields of the record
    // are copied verbatim from the first VPS: 12 bytes starting after its
    // 2-byte length prefix and 2-byte NAL unit header.
    const VPS_PTL_RANGE: std::ops::Range<usize> = 4..16;
    if vps_data.len() < VPS_PTL_RANGE.end {
        return Err(anyhow!("VPS too short"));
    }

    let num_arrays =
        [num_vps, num_sps, num_pps].into_iter().filter(|&n| n > 0).count() as u8;

    let mut extradata = Vec::new();
    extradata.push(1); // configurationVersion
    extradata.extend_from_slice(&vps_data[VPS_PTL_RANGE]);
    extradata.push(0xf0); // min_spatial_segmentation_idc
    extradata.push(0x00);
    extradata.push(0xfc); // parallelismType
    extradata.push(0xfc | chroma_format_idc);
    extradata.push(0xf8 | bit_depth_luma_minus8);
    extradata.push(0xf8 | bit_depth_chroma_minus8);
    extradata.push(0); // avgFrameRate
    extradata.push(0);
    extradata.push(nal_length_size as u8 - 1);
    extradata.push(num_arrays);

    for (type_, count, data) in [
        (NaluType::VpsNut, num_vps, &vps_data),
        (NaluType::SpsNut, num_sps, &sps_data),
        (NaluType::PpsNut, num_pps, &pps_data),
    ] {
        if count == 0 {
            continue;
        }
        // array_completeness set, then the NAL unit type.
        extradata.push(type_ as u8 | 0x80);
        extradata.write_u16::<BigEndian>(count)?;
        extradata.extend_from_slice(data);
    }

    Ok(extradata)
}
