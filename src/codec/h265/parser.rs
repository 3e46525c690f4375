// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An h.265 parameter set parser.
//!
//! Parses VPSs and SPSs from raw NAL units and derives the display
//! properties (color space, color depth, resolution) a pipeline needs to
//! configure a decoder. Each parse call returns a freshly populated struct
//! by value; no state is shared between calls.

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::codec::h265::rbsp::nal_to_rbsp;
use crate::codec::h265::rbsp::BitReader;
use crate::ColorDepth;
use crate::Resolution;
use crate::YuvColorSpace;

/// 7.4.3.1: vps_max_sub_layers_minus1 is in [0, 6].
pub const MAX_SUB_LAYERS: usize = 7;
/// 7.4.3.2.1: sps_seq_parameter_set_id is in [0, 15].
pub const MAX_SPS_COUNT: u32 = 16;
/// A.4.2: MaxDpbSize is bounded above by 16.
pub const MAX_DPB_SIZE: u32 = 16;
/// 7.4.3.2.1: num_short_term_ref_pic_sets is in [0, 64].
pub const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
/// 7.4.3.2.1: num_long_term_ref_pics_sps is in [0, 32].
pub const MAX_LONG_TERM_REF_PICS: u32 = 32;
/// 7.4.3.1: vps_num_layer_sets_minus1 is in [0, 1023].
const MAX_LAYER_SETS: u32 = 1024;

// From Table 7-5.
const DEFAULT_SCALING_LIST_0: [u8; 16] = [16; 16];

// From Table 7-6.
const DEFAULT_SCALING_LIST_1: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

// From Table 7-6.
const DEFAULT_SCALING_LIST_2: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

/// Table E-1 sample aspect ratios, indexed by aspect_ratio_idc - 1.
const SAMPLE_ASPECT_RATIOS: [(u16, u16); 16] = [
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// aspect_ratio_idc value signalling an explicit sar_width/sar_height pair.
const EXTENDED_SAR: u8 = 255;

/// Table 7-1 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU, i.e. the start of a frame decodable
    /// without reference to earlier frames.
    pub fn is_irap(&self) -> bool {
        (*self as u32) >= Self::BlaWLp as u32 && (*self as u32) <= Self::RsvIrapVcl23 as u32
    }
}

/// The nal_unit_header() of a NAL unit. See 7.3.1.2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    /// The NALU type.
    pub type_: NaluType,
    /// Identifier of the layer the NAL unit belongs or applies to.
    pub nuh_layer_id: u8,
    /// Minus 1, a temporal identifier for the NAL unit.
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let mut r = bitreader::BitReader::new(data);

        // Skip forbidden_zero_bit.
        r.skip(1)?;

        Ok(Self {
            type_: NaluType::n(r.read_u32(6)?).ok_or(anyhow!("invalid NALU type"))?,
            nuh_layer_id: r.read_u8(6)?,
            nuh_temporal_id_plus1: r.read_u8(3)?,
        })
    }
}

/// The per-layer half of profile_tier_level(): profile space, flags and
/// level for either the "general" layer or one temporal sub-layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PtlCommon {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    /// profile_compatibility_flag[ j ] equal to true indicates conformance
    /// to the profile with profile_idc equal to j.
    pub profile_compatibility_flag: [bool; 32],
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    /* present for the format range / high throughput / screen content
     * profile groups only, see A.3 */
    pub max_12bit_constraint_flag: bool,
    pub max_10bit_constraint_flag: bool,
    pub max_8bit_constraint_flag: bool,
    pub max_422chroma_constraint_flag: bool,
    pub max_420chroma_constraint_flag: bool,
    pub max_monochrome_constraint_flag: bool,
    pub intra_constraint_flag: bool,
    pub one_picture_only_constraint_flag: bool,
    pub lower_bit_rate_constraint_flag: bool,
    pub max_14bit_constraint_flag: bool,
    pub inbld_flag: bool,
    /// Level conformance indication, 30 times the level number of Table A.8.
    pub level_idc: u8,
}

impl PtlCommon {
    /// Parses everything in front of the level_idc field of one
    /// profile-tier slot.
    fn parse_profile(&mut self, r: &mut BitReader) -> anyhow::Result<()> {
        self.profile_space = r.read_bits(2)?;
        self.tier_flag = r.read_bit()?;
        self.profile_idc = r.read_bits(5)?;

        for flag in self.profile_compatibility_flag.iter_mut() {
            *flag = r.read_bit()?;
        }

        self.progressive_source_flag = r.read_bit()?;
        self.interlaced_source_flag = r.read_bit()?;
        self.non_packed_constraint_flag = r.read_bit()?;
        self.frame_only_constraint_flag = r.read_bit()?;

        // A.3: the constraint flag layout depends on the profile, where a
        // profile is selected either through profile_idc or through its
        // compatibility flag.
        let profile_idc = self.profile_idc;
        let compat = self.profile_compatibility_flag;
        let matches_profile = |idc: u8| profile_idc == idc || compat[usize::from(idc)];

        if (4..=11).any(matches_profile) {
            self.max_12bit_constraint_flag = r.read_bit()?;
            self.max_10bit_constraint_flag = r.read_bit()?;
            self.max_8bit_constraint_flag = r.read_bit()?;
            self.max_422chroma_constraint_flag = r.read_bit()?;
            self.max_420chroma_constraint_flag = r.read_bit()?;
            self.max_monochrome_constraint_flag = r.read_bit()?;
            self.intra_constraint_flag = r.read_bit()?;
            self.one_picture_only_constraint_flag = r.read_bit()?;
            self.lower_bit_rate_constraint_flag = r.read_bit()?;
            if [5, 9, 10, 11].into_iter().any(matches_profile) {
                self.max_14bit_constraint_flag = r.read_bit()?;
                r.skip_bits(33)?; // reserved_zero_33bits
            } else {
                r.skip_bits(34)?; // reserved_zero_34bits
            }
        } else if matches_profile(2) {
            r.skip_bits(7)?; // reserved_zero_7bits
            self.one_picture_only_constraint_flag = r.read_bit()?;
            r.skip_bits(35)?; // reserved_zero_35bits
        } else {
            r.skip_bits(43)?; // reserved_zero_43bits
        }

        if [1, 2, 3, 4, 5, 9, 11].into_iter().any(matches_profile) {
            self.inbld_flag = r.read_bit()?;
        } else {
            r.skip_bits(1)?; // reserved_zero_bit
        }

        Ok(())
    }
}

/// The profile_tier_level() data of a VPS or SPS. See 7.3.3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    /// Capabilities of the whole bitstream.
    pub general: PtlCommon,
    /// Per-sublayer capabilities, valid up to index maxNumSubLayers - 2.
    pub sub_layer: [PtlCommon; MAX_SUB_LAYERS - 1],
    pub sub_layer_profile_present_flag: [bool; MAX_SUB_LAYERS - 1],
    pub sub_layer_level_present_flag: [bool; MAX_SUB_LAYERS - 1],
}

impl ProfileTierLevel {
    fn parse(
        r: &mut BitReader,
        profile_present_flag: bool,
        max_num_sub_layers: u8,
    ) -> anyhow::Result<ProfileTierLevel> {
        let mut ptl = ProfileTierLevel::default();

        if profile_present_flag {
            ptl.general.parse_profile(r)?;
        }
        ptl.general.level_idc = r.read_bits(8)?;

        let num_sub_layers = usize::from(max_num_sub_layers) - 1;
        for i in 0..num_sub_layers {
            ptl.sub_layer_profile_present_flag[i] = r.read_bit()?;
            ptl.sub_layer_level_present_flag[i] = r.read_bit()?;
        }

        // The presence flag list is padded to 8 slots.
        if max_num_sub_layers > 1 {
            for _ in num_sub_layers..8 {
                r.skip_bits(2)?; // reserved_zero_2bits
            }
        }

        for i in 0..num_sub_layers {
            if ptl.sub_layer_profile_present_flag[i] {
                ptl.sub_layer[i].parse_profile(r)?;
            }
            if ptl.sub_layer_level_present_flag[i] {
                ptl.sub_layer[i].level_idc = r.read_bits(8)?;
            }
        }

        Ok(ptl)
    }
}

/// The scaling_list_data() syntax. See 7.3.4.
///
/// 32x32 matrices only exist for matrixId 0 and 3; they are stored at
/// matrixId / 3.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 6],
    pub scaling_list_16x16: [[u8; 64]; 6],
    pub scaling_list_32x32: [[u8; 64]; 2],
    pub scaling_list_dc_coef_16x16: [i16; 6],
    pub scaling_list_dc_coef_32x32: [i16; 2],
}

impl Default for ScalingLists {
    fn default() -> Self {
        Self {
            scaling_list_4x4: [[0; 16]; 6],
            scaling_list_8x8: [[0; 64]; 6],
            scaling_list_16x16: [[0; 64]; 6],
            scaling_list_32x32: [[0; 64]; 2],
            scaling_list_dc_coef_16x16: [0; 6],
            scaling_list_dc_coef_32x32: [0; 2],
        }
    }
}

impl ScalingLists {
    /// Returns the coefficient storage for (size_id, matrix_id) together
    /// with its DC coefficient slot, if the size class has one.
    fn list_mut(
        &mut self,
        size_id: usize,
        matrix_id: usize,
    ) -> anyhow::Result<(&mut [u8], Option<&mut i16>)> {
        let index = if size_id == 3 { matrix_id / 3 } else { matrix_id };
        match size_id {
            0 => Ok((&mut self.scaling_list_4x4[index], None)),
            1 => Ok((&mut self.scaling_list_8x8[index], None)),
            2 => Ok((
                &mut self.scaling_list_16x16[index],
                Some(&mut self.scaling_list_dc_coef_16x16[index]),
            )),
            3 => Ok((
                &mut self.scaling_list_32x32[index],
                Some(&mut self.scaling_list_dc_coef_32x32[index]),
            )),
            _ => Err(anyhow!("invalid size_id {}", size_id)),
        }
    }

    /// Fills (size_id, matrix_id) from Table 7-5/7-6 with the DC
    /// coefficient inferred as 16.
    fn use_default(&mut self, size_id: usize, matrix_id: usize) -> anyhow::Result<()> {
        let src: &[u8] = if size_id == 0 {
            &DEFAULT_SCALING_LIST_0
        } else if matrix_id <= 2 {
            &DEFAULT_SCALING_LIST_1
        } else {
            &DEFAULT_SCALING_LIST_2
        };

        let (dst, dc) = self.list_mut(size_id, matrix_id)?;
        dst.copy_from_slice(src);
        if let Some(dc) = dc {
            *dc = 16;
        }

        Ok(())
    }

    /// Copies (size_id, ref_matrix_id) over (size_id, matrix_id),
    /// implementing scaling list prediction (7-42).
    fn use_reference(
        &mut self,
        size_id: usize,
        matrix_id: usize,
        ref_matrix_id: usize,
    ) -> anyhow::Result<()> {
        let mut coefs = [0u8; 64];

        let (src, src_dc) = self.list_mut(size_id, ref_matrix_id)?;
        let num_coefs = src.len();
        coefs[..num_coefs].copy_from_slice(src);
        let dc = src_dc.map(|dc| *dc);

        let (dst, dst_dc) = self.list_mut(size_id, matrix_id)?;
        dst.copy_from_slice(&coefs[..num_coefs]);
        if let (Some(slot), Some(dc)) = (dst_dc, dc) {
            *slot = dc;
        }

        Ok(())
    }

    fn parse(r: &mut BitReader) -> anyhow::Result<ScalingLists> {
        let mut sl = ScalingLists::default();

        // 7.4.5
        for size_id in 0..4usize {
            let step = if size_id == 3 { 3 } else { 1 };
            for matrix_id in (0..6usize).step_by(step) {
                let scaling_list_pred_mode_flag = r.read_bit()?;
                if !scaling_list_pred_mode_flag {
                    let max_delta = if size_id == 3 { matrix_id / 3 } else { matrix_id };
                    let pred_matrix_id_delta: usize = r.read_ue_max(max_delta as u32)?;

                    if pred_matrix_id_delta == 0 {
                        sl.use_default(size_id, matrix_id)?;
                    } else {
                        let ref_matrix_id = matrix_id - pred_matrix_id_delta * step;
                        sl.use_reference(size_id, matrix_id, ref_matrix_id)?;
                    }
                } else {
                    let mut next_coef: i32 = 8;

                    let (coefs, dc_slot) = sl.list_mut(size_id, matrix_id)?;
                    if size_id > 1 {
                        // scaling_list_dc_coef_minus8 is in [-7, 247], so
                        // the DC coefficient itself is in [1, 255].
                        let dc = r.read_se_bounded::<i32>(-7, 247)? + 8;
                        next_coef = dc;
                        if let Some(slot) = dc_slot {
                            *slot = dc as i16;
                        }
                    }

                    for coef in coefs.iter_mut() {
                        let scaling_list_delta_coef: i32 = r.read_se_bounded(-128, 127)?;
                        next_coef = (next_coef + scaling_list_delta_coef + 256) % 256;
                        *coef = next_coef as u8;
                    }
                }
            }
        }

        Ok(sl)
    }
}

/// A st_ref_pic_set() entry, fully resolved: the delta-POC arrays are
/// reconstructed even when the entry was inter-predicted from an earlier
/// one. See 7.4.8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    /// NumDeltaPocs = NumNegativePics + NumPositivePics (7-71).
    pub num_delta_pocs: u8,
    pub num_negative_pics: u8,
    pub num_positive_pics: u8,
    pub used_by_curr_pic_s0: [bool; 16],
    pub used_by_curr_pic_s1: [bool; 16],
    /// Strictly decreasing, negative POC deltas.
    pub delta_poc_s0: [i32; 16],
    /// Strictly increasing, positive POC deltas.
    pub delta_poc_s1: [i32; 16],
}

/// Parses one st_ref_pic_set() entry. `prior_sets` holds the already
/// parsed entries [0, st_rps_idx), which entry st_rps_idx may be
/// inter-predicted from; `max_dec_pic_buffering` bounds the picture counts.
fn parse_short_term_ref_pic_set(
    r: &mut BitReader,
    prior_sets: &[ShortTermRefPicSet],
    num_short_term_ref_pic_sets: u32,
    st_rps_idx: u32,
    max_dec_pic_buffering: u32,
) -> anyhow::Result<ShortTermRefPicSet> {
    let mut st = ShortTermRefPicSet::default();

    let mut inter_ref_pic_set_prediction_flag = false;
    if st_rps_idx != 0 {
        inter_ref_pic_set_prediction_flag = r.read_bit()?;
    }

    if inter_ref_pic_set_prediction_flag {
        // delta_idx_minus1 is only present for the extra set signalled in a
        // slice header, which has index num_short_term_ref_pic_sets.
        let mut delta_idx: u32 = 1;
        if st_rps_idx == num_short_term_ref_pic_sets {
            delta_idx = r.read_ue_max::<u32>(st_rps_idx - 1)? + 1;
        }

        let delta_rps_sign = r.read_bit()?;
        let abs_delta_rps = r.read_ue_max::<i32>(32767)? + 1;
        let delta_rps = if delta_rps_sign {
            -abs_delta_rps
        } else {
            abs_delta_rps
        };

        let ref_rps = prior_sets
            .get((st_rps_idx - delta_idx) as usize)
            .ok_or(anyhow!("invalid delta_idx"))?;
        let ref_num_delta_pocs = usize::from(ref_rps.num_delta_pocs);
        let ref_num_negative = usize::from(ref_rps.num_negative_pics);
        let ref_num_positive = usize::from(ref_rps.num_positive_pics);

        // One flag pair per delta POC of the reference set, plus one for
        // the deltaRps entry itself.
        let mut used_by_curr_pic_flag = [false; 33];
        let mut use_delta_flag = [false; 33];
        if ref_num_delta_pocs >= used_by_curr_pic_flag.len() {
            return Err(anyhow!("reference set has too many delta POCs"));
        }
        for j in 0..=ref_num_delta_pocs {
            used_by_curr_pic_flag[j] = r.read_bit()?;
            if !used_by_curr_pic_flag[j] {
                use_delta_flag[j] = r.read_bit()?;
            }
        }

        // Derive NumNegativePics, DeltaPocS0 and UsedByCurrPicS0 (7-61):
        // three ordered passes over the reference set, keeping entries that
        // land on the negative side after applying deltaRps.
        let mut i = 0;
        for j in (0..ref_num_positive).rev() {
            let d_poc = ref_rps.delta_poc_s1[j] + delta_rps;
            if d_poc < 0 && use_delta_flag[ref_num_negative + j] {
                if i >= st.delta_poc_s0.len() {
                    return Err(anyhow!("too many negative pictures"));
                }
                st.delta_poc_s0[i] = d_poc;
                st.used_by_curr_pic_s0[i] = used_by_curr_pic_flag[ref_num_negative + j];
                i += 1;
            }
        }
        if delta_rps < 0 && use_delta_flag[ref_num_delta_pocs] {
            if i >= st.delta_poc_s0.len() {
                return Err(anyhow!("too many negative pictures"));
            }
            st.delta_poc_s0[i] = delta_rps;
            st.used_by_curr_pic_s0[i] = used_by_curr_pic_flag[ref_num_delta_pocs];
            i += 1;
        }
        for j in 0..ref_num_negative {
            let d_poc = ref_rps.delta_poc_s0[j] + delta_rps;
            if d_poc < 0 && use_delta_flag[j] {
                if i >= st.delta_poc_s0.len() {
                    return Err(anyhow!("too many negative pictures"));
                }
                st.delta_poc_s0[i] = d_poc;
                st.used_by_curr_pic_s0[i] = used_by_curr_pic_flag[j];
                i += 1;
            }
        }
        st.num_negative_pics = i as u8;

        // Derive NumPositivePics, DeltaPocS1 and UsedByCurrPicS1 (7-62),
        // the mirror image of the above.
        let mut i = 0;
        for j in (0..ref_num_negative).rev() {
            let d_poc = ref_rps.delta_poc_s0[j] + delta_rps;
            if d_poc > 0 && use_delta_flag[j] {
                if i >= st.delta_poc_s1.len() {
                    return Err(anyhow!("too many positive pictures"));
                }
                st.delta_poc_s1[i] = d_poc;
                st.used_by_curr_pic_s1[i] = used_by_curr_pic_flag[j];
                i += 1;
            }
        }
        if delta_rps > 0 && use_delta_flag[ref_num_delta_pocs] {
            if i >= st.delta_poc_s1.len() {
                return Err(anyhow!("too many positive pictures"));
            }
            st.delta_poc_s1[i] = delta_rps;
            st.used_by_curr_pic_s1[i] = used_by_curr_pic_flag[ref_num_delta_pocs];
            i += 1;
        }
        for j in 0..ref_num_positive {
            let d_poc = ref_rps.delta_poc_s1[j] + delta_rps;
            if d_poc > 0 && use_delta_flag[ref_num_negative + j] {
                if i >= st.delta_poc_s1.len() {
                    return Err(anyhow!("too many positive pictures"));
                }
                st.delta_poc_s1[i] = d_poc;
                st.used_by_curr_pic_s1[i] = used_by_curr_pic_flag[ref_num_negative + j];
                i += 1;
            }
        }
        st.num_positive_pics = i as u8;
    } else {
        let bound = std::cmp::min(max_dec_pic_buffering, st.delta_poc_s0.len() as u32);
        st.num_negative_pics = r.read_ue_max(bound)?;
        st.num_positive_pics = r.read_ue_max(bound)?;

        for i in 0..usize::from(st.num_negative_pics) {
            // delta_poc_s0_minus1, in [0, 2^15 - 1].
            let delta_poc_s0 = r.read_ue_max::<i32>(32767)? + 1;
            st.used_by_curr_pic_s0[i] = r.read_bit()?;

            if i == 0 {
                st.delta_poc_s0[i] = -delta_poc_s0;
            } else {
                st.delta_poc_s0[i] = st.delta_poc_s0[i - 1] - delta_poc_s0;
            }
        }

        for i in 0..usize::from(st.num_positive_pics) {
            let delta_poc_s1 = r.read_ue_max::<i32>(32767)? + 1;
            st.used_by_curr_pic_s1[i] = r.read_bit()?;

            if i == 0 {
                st.delta_poc_s1[i] = delta_poc_s1;
            } else {
                st.delta_poc_s1[i] = st.delta_poc_s1[i - 1] + delta_poc_s1;
            }
        }
    }

    st.num_delta_pocs = st.num_negative_pics + st.num_positive_pics;
    Ok(st)
}

/// The vui_parameters() data of an SPS. See E.2.1.
///
/// The HRD block a VUI may carry is consumed for alignment but not kept.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    /* if aspect_ratio_idc == EXTENDED_SAR */
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_appropriate_flag: bool,

    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    /// ISO 23001-8 Table 2 color primaries, 0 when not signalled.
    pub colour_primaries: u8,
    /// ISO 23001-8 Table 3 transfer characteristics, 0 when not signalled.
    pub transfer_characteristics: u8,
    /// ISO 23001-8 Table 4 matrix coefficients, 0 when not signalled.
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,

    pub default_display_window_flag: bool,
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    /// Plus 1 applied; valid when poc_proportional_to_timing_flag is set.
    pub num_ticks_poc_diff_one: u32,
    pub hrd_parameters_present_flag: bool,

    /* bitstream restriction fields */
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u32,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

impl VuiParams {
    /// The pixel aspect ratio, from Table E-1 or the extended SAR pair.
    /// `None` when not signalled or unspecified.
    pub fn sample_ratio(&self) -> Option<f64> {
        if !self.aspect_ratio_info_present_flag {
            return None;
        }
        match self.aspect_ratio_idc {
            idc @ 1..=16 => {
                let (w, h) = SAMPLE_ASPECT_RATIOS[usize::from(idc) - 1];
                Some(f64::from(w) / f64::from(h))
            }
            EXTENDED_SAR if self.sar_width != 0 && self.sar_height != 0 => {
                Some(f64::from(self.sar_width) / f64::from(self.sar_height))
            }
            _ => None,
        }
    }

    fn parse(r: &mut BitReader, max_num_sub_layers: u8) -> anyhow::Result<VuiParams> {
        let mut vui = VuiParams::default();

        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        let overscan_info_present_flag = r.read_bit()?;
        if overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        let video_signal_type_present_flag = r.read_bit()?;
        if video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.neutral_chroma_indication_flag = r.read_bit()?;
        vui.field_seq_flag = r.read_bit()?;
        vui.frame_field_info_present_flag = r.read_bit()?;

        vui.default_display_window_flag = r.read_bit()?;
        if vui.default_display_window_flag {
            vui.def_disp_win_left_offset = r.read_ue()?;
            vui.def_disp_win_right_offset = r.read_ue()?;
            vui.def_disp_win_top_offset = r.read_ue()?;
            vui.def_disp_win_bottom_offset = r.read_ue()?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits(16)?;
            vui.num_units_in_tick = (vui.num_units_in_tick << 16) | r.read_bits::<u32>(16)?;
            vui.time_scale = r.read_bits(16)?;
            vui.time_scale = (vui.time_scale << 16) | r.read_bits::<u32>(16)?;

            vui.poc_proportional_to_timing_flag = r.read_bit()?;
            if vui.poc_proportional_to_timing_flag {
                vui.num_ticks_poc_diff_one = r.read_ue::<u32>()? + 1;
            }

            vui.hrd_parameters_present_flag = r.read_bit()?;
            if vui.hrd_parameters_present_flag {
                skip_hrd_parameters(r, true, max_num_sub_layers)?;
            }
        }

        let bitstream_restriction_flag = r.read_bit()?;
        if bitstream_restriction_flag {
            vui.tiles_fixed_structure_flag = r.read_bit()?;
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.restricted_ref_pic_lists_flag = r.read_bit()?;
            vui.min_spatial_segmentation_idc = r.read_ue_max(4095)?;
            vui.max_bytes_per_pic_denom = r.read_ue_max(16)?;
            vui.max_bits_per_min_cu_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(15)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(15)?;
        }

        Ok(vui)
    }
}

/// Consumes a sub_layer_hrd_parameters() block. See E.2.3.
fn skip_sub_layer_hrd_parameters(
    r: &mut BitReader,
    cpb_cnt: u32,
    sub_pic_hrd_params_present_flag: bool,
) -> anyhow::Result<()> {
    for _ in 0..cpb_cnt {
        r.read_ue::<u32>()?; // bit_rate_value_minus1
        r.read_ue::<u32>()?; // cpb_size_value_minus1
        if sub_pic_hrd_params_present_flag {
            r.read_ue::<u32>()?; // cpb_size_du_value_minus1
            r.read_ue::<u32>()?; // bit_rate_du_value_minus1
        }
        r.read_bit()?; // cbr_flag
    }
    Ok(())
}

/// Consumes an hrd_parameters() block, keeping nothing. The fields are only
/// read to move the cursor over them. See E.2.2.
fn skip_hrd_parameters(
    r: &mut BitReader,
    common_inf_present_flag: bool,
    max_num_sub_layers: u8,
) -> anyhow::Result<()> {
    let mut nal_hrd_parameters_present_flag = false;
    let mut vcl_hrd_parameters_present_flag = false;
    let mut sub_pic_hrd_params_present_flag = false;

    if common_inf_present_flag {
        nal_hrd_parameters_present_flag = r.read_bit()?;
        vcl_hrd_parameters_present_flag = r.read_bit()?;
        if nal_hrd_parameters_present_flag || vcl_hrd_parameters_present_flag {
            sub_pic_hrd_params_present_flag = r.read_bit()?;
            if sub_pic_hrd_params_present_flag {
                r.skip_bits(8)?; // tick_divisor_minus2
                r.skip_bits(5)?; // du_cpb_removal_delay_increment_length_minus1
                r.skip_bits(1)?; // sub_pic_cpb_params_in_pic_timing_sei_flag
                r.skip_bits(5)?; // dpb_output_delay_du_length_minus1
            }
            r.skip_bits(4)?; // bit_rate_scale
            r.skip_bits(4)?; // cpb_size_scale
            if sub_pic_hrd_params_present_flag {
                r.skip_bits(4)?; // cpb_size_du_scale
            }
            r.skip_bits(5)?; // initial_cpb_removal_delay_length_minus1
            r.skip_bits(5)?; // au_cpb_removal_delay_length_minus1
            r.skip_bits(5)?; // dpb_output_delay_length_minus1
        }
    }

    for _ in 0..max_num_sub_layers {
        let fixed_pic_rate_general_flag = r.read_bit()?;
        let mut fixed_pic_rate_within_cvs_flag = true;
        if !fixed_pic_rate_general_flag {
            fixed_pic_rate_within_cvs_flag = r.read_bit()?;
        }

        let mut low_delay_hrd_flag = false;
        if fixed_pic_rate_within_cvs_flag {
            r.read_ue::<u32>()?; // elemental_duration_in_tc_minus1
        } else {
            low_delay_hrd_flag = r.read_bit()?;
        }

        let mut cpb_cnt: u32 = 1;
        if !low_delay_hrd_flag {
            cpb_cnt = r.read_ue_max::<u32>(31)? + 1; // cpb_cnt_minus1
        }

        if nal_hrd_parameters_present_flag {
            skip_sub_layer_hrd_parameters(r, cpb_cnt, sub_pic_hrd_params_present_flag)?;
        }
        if vcl_hrd_parameters_present_flag {
            skip_sub_layer_hrd_parameters(r, cpb_cnt, sub_pic_hrd_params_present_flag)?;
        }
    }

    Ok(())
}

/// A parsed H.265 Video Parameter Set.
///
/// "Minus 1" and "plus 1" syntax elements are stored with the offset
/// applied, so `max_sub_layers` is the actual number of sub-layers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    /// Identifies the VPS for reference by other syntax elements.
    pub video_parameter_set_id: u8,
    pub base_layer_internal_flag: bool,
    pub base_layer_available_flag: bool,
    /// Maximum allowed number of layers in each CVS referring to the VPS.
    pub max_layers: u8,
    /// Maximum number of temporal sub-layers that may be present in each
    /// CVS referring to the VPS, in [1, 7].
    pub max_sub_layers: u8,
    pub temporal_id_nesting_flag: bool,
    /// profile_tier_level() data.
    pub profile_tier_level: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    /// Maximum required size of the decoded picture buffer per sub-layer,
    /// in [1, 16].
    pub max_dec_pic_buffering: [u32; MAX_SUB_LAYERS],
    /// Maximum allowed number of reorderable pictures per sub-layer.
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    /// vps_max_latency_increase_plus1 minus 1; all-ones means no limit.
    pub max_latency_increase: [u32; MAX_SUB_LAYERS],
    pub max_layer_id: u8,
    pub num_layer_sets: u32,
    pub timing_info_present_flag: bool,
    /* if timing_info_present_flag */
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one: u32,
    pub num_hrd_parameters: u32,
}

impl Vps {
    /// Parses a VPS from a raw NAL unit, header and emulation prevention
    /// bytes included.
    pub fn parse(nalu: &[u8]) -> anyhow::Result<Vps> {
        let rbsp = nal_to_rbsp(nalu).context("parsing VPS")?;
        let mut r = BitReader::new(&rbsp);
        Self::parse_rbsp(&mut r).context("parsing VPS")
    }

    /// Implements 7.3.2.1, up to (and excluding) vps_extension_flag.
    fn parse_rbsp(r: &mut BitReader) -> anyhow::Result<Vps> {
        let mut vps = Vps {
            video_parameter_set_id: r.read_bits(4)?,
            base_layer_internal_flag: r.read_bit()?,
            base_layer_available_flag: r.read_bit()?,
            max_layers: r.read_bits::<u8>(6)? + 1,
            max_sub_layers: r.read_bits::<u8>(3)? + 1,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if usize::from(vps.max_sub_layers) > MAX_SUB_LAYERS {
            return Err(anyhow!("invalid max_sub_layers {}", vps.max_sub_layers));
        }

        r.skip_bits(16)?; // vps_reserved_0xffff_16bits

        vps.profile_tier_level = ProfileTierLevel::parse(r, true, vps.max_sub_layers)?;

        vps.sub_layer_ordering_info_present_flag = r.read_bit()?;
        let start = if vps.sub_layer_ordering_info_present_flag {
            0
        } else {
            usize::from(vps.max_sub_layers) - 1
        };
        for i in start..usize::from(vps.max_sub_layers) {
            vps.max_dec_pic_buffering[i] = r.read_ue_max::<u32>(MAX_DPB_SIZE - 1)? + 1;
            vps.max_num_reorder_pics[i] = r.read_ue_max(vps.max_dec_pic_buffering[i] - 1)?;
            vps.max_latency_increase[i] = r.read_ue::<u32>()?.wrapping_sub(1);
        }

        vps.max_layer_id = r.read_bits(6)?;
        vps.num_layer_sets = r.read_ue_max::<u32>(MAX_LAYER_SETS - 1)? + 1;
        for _ in 1..vps.num_layer_sets {
            for _ in 0..=vps.max_layer_id {
                r.skip_bits(1)?; // layer_id_included_flag[i][j]
            }
        }

        vps.timing_info_present_flag = r.read_bit()?;
        if vps.timing_info_present_flag {
            vps.num_units_in_tick = r.read_bits(16)?;
            vps.num_units_in_tick = (vps.num_units_in_tick << 16) | r.read_bits::<u32>(16)?;
            vps.time_scale = r.read_bits(16)?;
            vps.time_scale = (vps.time_scale << 16) | r.read_bits::<u32>(16)?;

            vps.poc_proportional_to_timing_flag = r.read_bit()?;
            if vps.poc_proportional_to_timing_flag {
                vps.num_ticks_poc_diff_one = r.read_ue::<u32>()? + 1;
            }

            vps.num_hrd_parameters = r.read_ue_max(vps.num_layer_sets)?;
            for i in 0..vps.num_hrd_parameters {
                let min_idx = if vps.base_layer_internal_flag { 0 } else { 1 };
                // hrd_layer_set_idx[i]
                r.read_ue_bounded::<u32>(min_idx, vps.num_layer_sets - 1)?;

                let mut cprms_present_flag = true;
                if i > 0 {
                    cprms_present_flag = r.read_bit()?;
                }
                skip_hrd_parameters(r, cprms_present_flag, vps.max_sub_layers)?;
            }
        }

        // vps_extension_flag and everything after it is ignored.
        Ok(vps)
    }
}

/// A parsed H.265 Sequence Parameter Set.
///
/// As with [`Vps`], "minus 1"/"plus 1" offsets are already applied, so
/// `bit_depth_luma` is the actual bit depth.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// The vps_video_parameter_set_id of the active VPS.
    pub video_parameter_set_id: u8,
    /// Maximum number of temporal sub-layers, in [1, 7].
    pub max_sub_layers: u8,
    pub temporal_id_nesting_flag: bool,
    /// profile_tier_level() data.
    pub profile_tier_level: ProfileTierLevel,
    /// Identifies the SPS for reference by other syntax elements.
    pub seq_parameter_set_id: u32,
    /// Chroma sampling relative to luma sampling, see 6.2: 0 is
    /// monochrome, 1 is 4:2:0, 2 is 4:2:2 and 3 is 4:4:4.
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    /// Width of each decoded picture in units of luma samples.
    pub pic_width_in_luma_samples: u32,
    /// Height of each decoded picture in units of luma samples.
    pub pic_height_in_luma_samples: u32,
    pub conformance_window_flag: bool,
    /* if conformance_window_flag */
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    /// Bit depth of the luma samples, in [8, 16].
    pub bit_depth_luma: u32,
    /// Bit depth of the chroma samples, in [8, 16].
    pub bit_depth_chroma: u32,
    /// log2 of MaxPicOrderCntLsb, in [4, 16].
    pub log2_max_pic_order_cnt_lsb: u32,
    pub max_dec_pic_buffering: [u32; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub max_latency_increase: [u32; MAX_SUB_LAYERS],
    pub log2_min_luma_coding_block_size: u32,
    pub log2_diff_max_min_luma_coding_block_size: u32,
    pub log2_min_luma_transform_block_size: u32,
    pub log2_diff_max_min_luma_transform_block_size: u32,
    pub max_transform_hierarchy_depth_inter: u32,
    pub max_transform_hierarchy_depth_intra: u32,
    pub scaling_list_enabled_flag: bool,
    pub scaling_list_data_present_flag: bool,
    /// Valid when scaling_list_data_present_flag is set.
    pub scaling_list: ScalingLists,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    /* if pcm_enabled_flag */
    pub pcm_sample_bit_depth_luma: u8,
    pub pcm_sample_bit_depth_chroma: u8,
    pub log2_min_pcm_luma_coding_block_size: u32,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u32,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u32,
    /// The st_ref_pic_set() entries, at most 64.
    pub short_term_ref_pic_set: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    /* if long_term_ref_pics_present_flag */
    pub num_long_term_ref_pics_sps: u32,
    pub lt_ref_pic_poc_lsb_sps: [u16; MAX_LONG_TERM_REF_PICS as usize],
    pub used_by_curr_pic_lt_sps_flag: [bool; MAX_LONG_TERM_REF_PICS as usize],
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui_parameters_present_flag: bool,
    /// The vui_parameters() data.
    pub vui: VuiParams,
}

/// Maps ISO 23001-8 color primaries to a color space guess.
fn primaries_guess(primaries: u8) -> u32 {
    match primaries {
        1 => GUESS_BT709,
        // BT470M, BT470BG, SMPTE170M, SMPTE240M.
        4..=7 => GUESS_BT601,
        9 => GUESS_BT2020,
        _ => 0,
    }
}

/// Maps ISO 23001-8 transfer characteristics to a color space guess.
fn transfer_guess(transfer: u8) -> u32 {
    match transfer {
        1 => GUESS_BT709,
        // GAMMA22, GAMMA28, SMPTE170M, SMPTE240M.
        4..=7 => GUESS_BT601,
        // BT2020_10, BT2020_12.
        14 | 15 => GUESS_BT2020,
        _ => 0,
    }
}

/// Maps ISO 23001-8 matrix coefficients to a color space guess.
fn matrix_guess(matrix: u8) -> u32 {
    match matrix {
        1 => GUESS_BT709,
        // BT470BG, SMPTE170M, SMPTE240M.
        5..=7 => GUESS_BT601,
        // BT2020_NCL, BT2020_CL.
        9 | 10 => GUESS_BT2020,
        _ => 0,
    }
}

const GUESS_BT601: u32 = 1 << 0;
const GUESS_BT709: u32 = 1 << 1;
const GUESS_BT2020: u32 = 1 << 2;

impl Sps {
    /// Parses an SPS from a raw NAL unit, header and emulation prevention
    /// bytes included.
    pub fn parse(nalu: &[u8]) -> anyhow::Result<Sps> {
        let rbsp = nal_to_rbsp(nalu).context("parsing SPS")?;
        let mut r = BitReader::new(&rbsp);
        Self::parse_rbsp(&mut r).context("parsing SPS")
    }

    /// Implements 7.3.2.2, up to (and excluding) sps_extension_present_flag.
    fn parse_rbsp(r: &mut BitReader) -> anyhow::Result<Sps> {
        let mut sps = Sps {
            video_parameter_set_id: r.read_bits(4)?,
            max_sub_layers: r.read_bits::<u8>(3)? + 1,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if usize::from(sps.max_sub_layers) > MAX_SUB_LAYERS {
            return Err(anyhow!("invalid max_sub_layers {}", sps.max_sub_layers));
        }

        sps.profile_tier_level = ProfileTierLevel::parse(r, true, sps.max_sub_layers)?;

        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT - 1)?;

        sps.chroma_format_idc = r.read_ue_max(3)?;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bit()?;
        }

        sps.pic_width_in_luma_samples = r.read_ue_bounded(1, u32::MAX)?;
        sps.pic_height_in_luma_samples = r.read_ue_bounded(1, u32::MAX)?;

        sps.conformance_window_flag = r.read_bit()?;
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.read_ue()?;
            sps.conf_win_right_offset = r.read_ue()?;
            sps.conf_win_top_offset = r.read_ue()?;
            sps.conf_win_bottom_offset = r.read_ue()?;
        }

        sps.bit_depth_luma = r.read_ue_max::<u32>(8)? + 8;
        sps.bit_depth_chroma = r.read_ue_max::<u32>(8)? + 8;

        sps.log2_max_pic_order_cnt_lsb = r.read_ue_max::<u32>(12)? + 4;

        let sub_layer_ordering_info_present_flag = r.read_bit()?;
        let start = if sub_layer_ordering_info_present_flag {
            0
        } else {
            usize::from(sps.max_sub_layers) - 1
        };
        for i in start..usize::from(sps.max_sub_layers) {
            sps.max_dec_pic_buffering[i] = r.read_ue_max::<u32>(MAX_DPB_SIZE - 1)? + 1;
            sps.max_num_reorder_pics[i] = r.read_ue_max(sps.max_dec_pic_buffering[i] - 1)?;
            sps.max_latency_increase[i] = r.read_ue::<u32>()?.wrapping_sub(1);
        }

        // 7.4.3.2.1: when absent, the ordering values of all sub-layers are
        // those of the highest one.
        if !sub_layer_ordering_info_present_flag {
            for i in 0..start {
                sps.max_dec_pic_buffering[i] = sps.max_dec_pic_buffering[start];
                sps.max_num_reorder_pics[i] = sps.max_num_reorder_pics[start];
                sps.max_latency_increase[i] = sps.max_latency_increase[start];
            }
        }

        sps.log2_min_luma_coding_block_size = r.read_ue::<u32>()? + 3;
        sps.log2_diff_max_min_luma_coding_block_size = r.read_ue()?;
        sps.log2_min_luma_transform_block_size = r.read_ue::<u32>()? + 2;
        sps.log2_diff_max_min_luma_transform_block_size = r.read_ue()?;

        sps.max_transform_hierarchy_depth_inter = r.read_ue()?;
        sps.max_transform_hierarchy_depth_intra = r.read_ue()?;

        sps.scaling_list_enabled_flag = r.read_bit()?;
        if sps.scaling_list_enabled_flag {
            sps.scaling_list_data_present_flag = r.read_bit()?;
            if sps.scaling_list_data_present_flag {
                sps.scaling_list = ScalingLists::parse(r)?;
            }
        }

        sps.amp_enabled_flag = r.read_bit()?;
        sps.sample_adaptive_offset_enabled_flag = r.read_bit()?;

        sps.pcm_enabled_flag = r.read_bit()?;
        if sps.pcm_enabled_flag {
            sps.pcm_sample_bit_depth_luma = r.read_bits::<u8>(4)? + 1;
            sps.pcm_sample_bit_depth_chroma = r.read_bits::<u8>(4)? + 1;
            sps.log2_min_pcm_luma_coding_block_size = r.read_ue::<u32>()? + 3;
            sps.log2_diff_max_min_pcm_luma_coding_block_size = r.read_ue()?;
            sps.pcm_loop_filter_disabled_flag = r.read_bit()?;

            if u32::from(sps.pcm_sample_bit_depth_luma) > sps.bit_depth_luma {
                return Err(anyhow!("invalid pcm_sample_bit_depth_luma"));
            }
            if u32::from(sps.pcm_sample_bit_depth_chroma) > sps.bit_depth_chroma {
                return Err(anyhow!("invalid pcm_sample_bit_depth_chroma"));
            }
        }

        sps.num_short_term_ref_pic_sets = r.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS)?;
        for i in 0..sps.num_short_term_ref_pic_sets {
            let st = parse_short_term_ref_pic_set(
                r,
                &sps.short_term_ref_pic_set,
                sps.num_short_term_ref_pic_sets,
                i,
                sps.max_dec_pic_buffering[usize::from(sps.max_sub_layers) - 1],
            )?;
            sps.short_term_ref_pic_set.push(st);
        }

        sps.long_term_ref_pics_present_flag = r.read_bit()?;
        if sps.long_term_ref_pics_present_flag {
            sps.num_long_term_ref_pics_sps = r.read_ue_max(MAX_LONG_TERM_REF_PICS)?;
            for i in 0..sps.num_long_term_ref_pics_sps as usize {
                sps.lt_ref_pic_poc_lsb_sps[i] =
                    r.read_bits(sps.log2_max_pic_order_cnt_lsb as usize)?;
                sps.used_by_curr_pic_lt_sps_flag[i] = r.read_bit()?;
            }
        }

        sps.temporal_mvp_enabled_flag = r.read_bit()?;
        sps.strong_intra_smoothing_enabled_flag = r.read_bit()?;

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            sps.vui = VuiParams::parse(r, sps.max_sub_layers)?;
        }

        // sps_extension_present_flag and everything after it is ignored.
        Ok(sps)
    }

    /// Width of the decoded picture in luma samples.
    pub fn width(&self) -> u32 {
        self.pic_width_in_luma_samples
    }

    /// Height of the decoded picture in luma samples.
    pub fn height(&self) -> u32 {
        self.pic_height_in_luma_samples
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }

    /// Guesses the color space from the VUI color description.
    ///
    /// Each of the three color description fields independently votes for a
    /// bucket; ties are broken by repeatedly clearing the lowest set bit of
    /// the vote mask until a single one remains, so wider-gamut guesses win.
    /// Without any vote the default is BT.709.
    pub fn color_space(&self) -> YuvColorSpace {
        let mut guess = primaries_guess(self.vui.colour_primaries)
            | transfer_guess(self.vui.transfer_characteristics)
            | matrix_guess(self.vui.matrix_coefficients);

        while guess & guess.wrapping_sub(1) != 0 {
            guess &= guess - 1;
        }

        match guess {
            GUESS_BT601 => YuvColorSpace::Bt601,
            GUESS_BT2020 => YuvColorSpace::Bt2020,
            _ => YuvColorSpace::Bt709,
        }
    }

    /// The luma color depth. Anything but 8, 10 or 12 bits falls back to 8
    /// so that an exotic stream misconfigures the decoder instead of
    /// crashing the pipeline.
    pub fn color_depth(&self) -> ColorDepth {
        match self.bit_depth_luma {
            10 => ColorDepth::Depth10,
            12 => ColorDepth::Depth12,
            _ => ColorDepth::Depth8,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    /// A synthetic, conforming VPS NAL unit: Main profile, level 2,
    /// single layer, single sub-layer, DPB size 5.
    pub const VPS_NAL: &[u8] = &[
        0x40, 0x01, 0x0c, 0x01, 0xff, 0xff, 0x01, 0x40, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00,
        0x03, 0x00, 0x00, 0x03, 0x00, 0x3c, 0x95, 0xc0, 0x90,
    ];

    /// A synthetic, conforming SPS NAL unit: Main profile, level 2, 320x184
    /// 4:2:0 8-bit, square pixels, BT.709 color description, 30 fps
    /// timing info. Contains emulation prevention bytes.
    pub const SPS_NAL: &[u8] = &[
        0x42, 0x01, 0x01, 0x01, 0x40, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00,
        0x03, 0x00, 0x3c, 0xa0, 0x0a, 0x08, 0x0b, 0x9f, 0x79, 0x65, 0x79, 0x24, 0xca, 0xf0, 0x16,
        0xa0, 0x20, 0x20, 0x20, 0x80, 0x00, 0x00, 0x03, 0x00, 0x80, 0x00, 0x00, 0x0f, 0x04,
    ];
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::SPS_NAL;
    use super::test_fixtures::VPS_NAL;
    use super::*;

    #[test]
    fn vps_parsing() {
        let vps = Vps::parse(VPS_NAL).unwrap();

        assert_eq!(vps.video_parameter_set_id, 0);
        assert!(vps.base_layer_internal_flag);
        assert!(vps.base_layer_available_flag);
        assert_eq!(vps.max_layers, 1);
        assert_eq!(vps.max_sub_layers, 1);
        assert!(vps.temporal_id_nesting_flag);

        assert_eq!(vps.profile_tier_level.general.profile_space, 0);
        assert!(!vps.profile_tier_level.general.tier_flag);
        assert_eq!(vps.profile_tier_level.general.profile_idc, 1);
        assert!(vps.profile_tier_level.general.profile_compatibility_flag[1]);
        assert!(!vps.profile_tier_level.general.profile_compatibility_flag[2]);
        assert!(vps.profile_tier_level.general.progressive_source_flag);
        assert!(vps.profile_tier_level.general.frame_only_constraint_flag);
        assert!(!vps.profile_tier_level.general.inbld_flag);
        assert_eq!(vps.profile_tier_level.general.level_idc, 60);

        assert!(vps.sub_layer_ordering_info_present_flag);
        assert_eq!(vps.max_dec_pic_buffering[0], 5);
        assert_eq!(vps.max_num_reorder_pics[0], 2);
        assert_eq!(vps.max_latency_increase[0], u32::MAX);
        for i in 1..MAX_SUB_LAYERS {
            assert_eq!(vps.max_dec_pic_buffering[i], 0);
            assert_eq!(vps.max_num_reorder_pics[i], 0);
            assert_eq!(vps.max_latency_increase[i], 0);
        }

        assert_eq!(vps.max_layer_id, 0);
        assert_eq!(vps.num_layer_sets, 1);
        assert!(!vps.timing_info_present_flag);
    }

    #[test]
    fn sps_parsing() {
        let sps = Sps::parse(SPS_NAL).unwrap();

        assert_eq!(sps.video_parameter_set_id, 0);
        assert_eq!(sps.max_sub_layers, 1);
        assert!(sps.temporal_id_nesting_flag);

        assert_eq!(sps.profile_tier_level.general.profile_idc, 1);
        assert_eq!(sps.profile_tier_level.general.level_idc, 60);

        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.chroma_format_idc, 1);
        assert!(!sps.separate_colour_plane_flag);
        assert_eq!(sps.pic_width_in_luma_samples, 320);
        assert_eq!(sps.pic_height_in_luma_samples, 184);

        assert!(sps.conformance_window_flag);
        assert_eq!(sps.conf_win_left_offset, 0);
        assert_eq!(sps.conf_win_right_offset, 0);
        assert_eq!(sps.conf_win_top_offset, 0);
        assert_eq!(sps.conf_win_bottom_offset, 2);

        assert_eq!(sps.bit_depth_luma, 8);
        assert_eq!(sps.bit_depth_chroma, 8);
        assert_eq!(sps.log2_max_pic_order_cnt_lsb, 8);

        assert_eq!(sps.max_dec_pic_buffering[0], 5);
        assert_eq!(sps.max_num_reorder_pics[0], 2);
        assert_eq!(sps.max_latency_increase[0], u32::MAX);

        assert_eq!(sps.log2_min_luma_coding_block_size, 3);
        assert_eq!(sps.log2_diff_max_min_luma_coding_block_size, 3);
        assert_eq!(sps.log2_min_luma_transform_block_size, 2);
        assert_eq!(sps.log2_diff_max_min_luma_transform_block_size, 3);
        assert_eq!(sps.max_transform_hierarchy_depth_inter, 0);
        assert_eq!(sps.max_transform_hierarchy_depth_intra, 0);

        assert!(!sps.scaling_list_enabled_flag);
        assert!(!sps.amp_enabled_flag);
        assert!(sps.sample_adaptive_offset_enabled_flag);
        assert!(!sps.pcm_enabled_flag);
        assert_eq!(sps.num_short_term_ref_pic_sets, 0);
        assert!(!sps.long_term_ref_pics_present_flag);
        assert!(sps.temporal_mvp_enabled_flag);
        assert!(sps.strong_intra_smoothing_enabled_flag);

        assert!(sps.vui_parameters_present_flag);
        assert!(sps.vui.aspect_ratio_info_present_flag);
        assert_eq!(sps.vui.aspect_ratio_idc, 1);
        assert_eq!(sps.vui.sample_ratio(), Some(1.0));
        assert_eq!(sps.vui.video_format, 5);
        assert!(!sps.vui.video_full_range_flag);
        assert!(sps.vui.colour_description_present_flag);
        assert_eq!(sps.vui.colour_primaries, 1);
        assert_eq!(sps.vui.transfer_characteristics, 1);
        assert_eq!(sps.vui.matrix_coefficients, 1);
        assert!(sps.vui.timing_info_present_flag);
        assert_eq!(sps.vui.num_units_in_tick, 1);
        assert_eq!(sps.vui.time_scale, 30);

        assert_eq!(sps.width(), 320);
        assert_eq!(sps.height(), 184);
        assert_eq!(sps.color_space(), crate::YuvColorSpace::Bt709);
        assert_eq!(sps.color_depth(), crate::ColorDepth::Depth8);
    }

    #[test]
    fn truncated_sps_fails() {
        for len in 2..SPS_NAL.len() - 1 {
            assert!(Sps::parse(&SPS_NAL[..len]).is_err(), "length {}", len);
        }
    }

    #[test]
    fn nalu_header_parsing() {
        let header = NaluHeader::parse(VPS_NAL).unwrap();
        assert_eq!(header.type_, NaluType::VpsNut);
        assert_eq!(header.nuh_layer_id, 0);
        assert_eq!(header.nuh_temporal_id_plus1, 1);

        assert!(NaluType::IdrWRadl.is_irap());
        assert!(NaluType::CraNut.is_irap());
        assert!(!NaluType::TrailR.is_irap());
        assert!(!NaluType::SpsNut.is_irap());
    }

    #[test]
    fn scaling_list_defaults() {
        let mut sl = ScalingLists::default();

        sl.use_default(0, 0).unwrap();
        assert_eq!(sl.scaling_list_4x4[0], [16; 16]);

        sl.use_default(1, 2).unwrap();
        assert_eq!(sl.scaling_list_8x8[2][63], 115);

        sl.use_default(2, 3).unwrap();
        assert_eq!(sl.scaling_list_16x16[3][63], 91);
        assert_eq!(sl.scaling_list_dc_coef_16x16[3], 16);

        sl.use_default(3, 0).unwrap();
        assert_eq!(sl.scaling_list_32x32[0][63], 115);
        sl.use_default(3, 3).unwrap();
        assert_eq!(sl.scaling_list_32x32[1][63], 91);
        assert_eq!(sl.scaling_list_dc_coef_32x32[1], 16);
    }

    #[test]
    fn scaling_list_reference() {
        let mut sl = ScalingLists::default();
        sl.use_default(2, 0).unwrap();
        sl.scaling_list_dc_coef_16x16[0] = 42;

        sl.use_reference(2, 4, 0).unwrap();
        assert_eq!(sl.scaling_list_16x16[4], sl.scaling_list_16x16[0]);
        assert_eq!(sl.scaling_list_dc_coef_16x16[4], 42);
    }

    #[test]
    fn scaling_list_explicit() {
        // A full scaling_list_data() payload:
        // - 4x4 matrix 0 is explicit, with every delta 1, so the
        //   coefficients run 9..=24;
        // - 16x16 matrix 1 is explicit with scaling_list_dc_coef_minus8 = 2
        //   and all-zero deltas, so DC and every coefficient are 10;
        // - 16x16 matrix 4 copies matrix 1 (pred_matrix_id_delta = 3);
        // - every other list takes the defaults (pred_matrix_id_delta = 0).
        let data = [
            0xa4, 0x92, 0x49, 0x24, 0x92, 0x49, 0x2a, 0xaa, 0xaa, 0xc9, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xfe, 0xa2, 0x2a,
        ];
        let mut r = BitReader::new(&data);

        let sl = ScalingLists::parse(&mut r).unwrap();

        let expected: [u8; 16] = std::array::from_fn(|i| 9 + i as u8);
        assert_eq!(sl.scaling_list_4x4[0], expected);
        assert_eq!(sl.scaling_list_4x4[1], [16; 16]);

        assert_eq!(sl.scaling_list_16x16[1], [10; 64]);
        assert_eq!(sl.scaling_list_dc_coef_16x16[1], 10);
        assert_eq!(sl.scaling_list_16x16[4], [10; 64]);
        assert_eq!(sl.scaling_list_dc_coef_16x16[4], 10);

        assert_eq!(sl.scaling_list_16x16[3][63], 91);
        assert_eq!(sl.scaling_list_dc_coef_16x16[3], 16);
        assert_eq!(sl.scaling_list_32x32[1][63], 91);
        assert_eq!(sl.scaling_list_dc_coef_32x32[1], 16);

        // A pred_matrix_id_delta pointing past the current matrix is
        // rejected. 4x4 matrix 0 explicit as above, matrix 1 with delta 2:
        let data = [0xa4, 0x92, 0x49, 0x24, 0x92, 0x49, 0x18];
        let mut r = BitReader::new(&data);
        assert!(ScalingLists::parse(&mut r).is_err());
    }

    #[test]
    fn short_term_rps_explicit() {
        // num_negative_pics = 2, num_positive_pics = 0, then two
        // (delta_poc_s0_minus1, used_by_curr_pic_s0_flag) pairs, both with
        // delta_poc_s0_minus1 = 0, so each step is 1:
        // ue(2) ue(0) | ue(0) 1 | ue(0) 1 = 011 1 1 1 1 1
        let data = [0b0111_1111];
        let mut r = BitReader::new(&data);

        let st = parse_short_term_ref_pic_set(&mut r, &[], 1, 0, MAX_DPB_SIZE).unwrap();

        assert_eq!(st.num_negative_pics, 2);
        assert_eq!(st.num_positive_pics, 0);
        assert_eq!(st.num_delta_pocs, 2);
        assert_eq!(st.delta_poc_s0[0], -1);
        assert_eq!(st.delta_poc_s0[1], -2);
        assert!(st.used_by_curr_pic_s0[0]);
        assert!(st.used_by_curr_pic_s0[1]);
    }

    #[test]
    fn short_term_rps_inter_predicted() {
        // Reference set at index 0: two negative pictures, -1 and -2.
        let data = [0b0111_1111];
        let mut r = BitReader::new(&data);
        let ref_rps = parse_short_term_ref_pic_set(&mut r, &[], 2, 0, MAX_DPB_SIZE).unwrap();

        // Index 1, inter-predicted with deltaRps = -1 and every entry of
        // the reference set (plus the deltaRps entry itself) kept through
        // use_delta_flag:
        // inter flag 1, sign 1, abs_delta_rps_minus1 ue(0),
        // then 3x (used_by_curr_pic 0, use_delta 1).
        let data = [0b1110_1010, 0b1000_0000];
        let mut r = BitReader::new(&data);
        let prior = [ref_rps];
        let st = parse_short_term_ref_pic_set(&mut r, &prior, 2, 1, MAX_DPB_SIZE).unwrap();

        // The deltaRps entry comes first, then the shifted reference
        // negatives in forward order.
        assert_eq!(st.num_negative_pics, 3);
        assert_eq!(st.num_positive_pics, 0);
        assert_eq!(st.num_delta_pocs, 3);
        assert_eq!(st.delta_poc_s0[0], -1);
        assert_eq!(st.delta_poc_s0[1], -2);
        assert_eq!(st.delta_poc_s0[2], -3);
        assert!(!st.used_by_curr_pic_s0[0]);
        assert!(!st.used_by_curr_pic_s0[1]);
        assert!(!st.used_by_curr_pic_s0[2]);
    }

    #[test]
    fn short_term_rps_inter_predicted_positive() {
        // Reference set at index 0: one negative picture (-1) and one
        // positive picture (+1), both used:
        // ue(1) ue(1) | ue(0) 1 | ue(0) 1 = 010 010 1 1 1 1
        let data = [0b0100_1011, 0b1100_0000];
        let mut r = BitReader::new(&data);
        let ref_rps = parse_short_term_ref_pic_set(&mut r, &[], 2, 0, MAX_DPB_SIZE).unwrap();
        assert_eq!(ref_rps.delta_poc_s0[0], -1);
        assert_eq!(ref_rps.delta_poc_s1[0], 1);

        // Index 1, inter-predicted with deltaRps = +1 and every entry kept
        // through use_delta_flag:
        // inter flag 1, sign 0, abs_delta_rps_minus1 ue(0),
        // then 3x (used_by_curr_pic 0, use_delta 1).
        let data = [0b1010_1010, 0b1000_0000];
        let mut r = BitReader::new(&data);
        let prior = [ref_rps];
        let st = parse_short_term_ref_pic_set(&mut r, &prior, 2, 1, MAX_DPB_SIZE).unwrap();

        // The shifted reference negative lands on 0 and is dropped; the
        // deltaRps entry comes first on the positive side, then the shifted
        // reference positive.
        assert_eq!(st.num_negative_pics, 0);
        assert_eq!(st.num_positive_pics, 2);
        assert_eq!(st.num_delta_pocs, 2);
        assert_eq!(st.delta_poc_s1[0], 1);
        assert_eq!(st.delta_poc_s1[1], 2);
        assert!(!st.used_by_curr_pic_s1[0]);
        assert!(!st.used_by_curr_pic_s1[1]);
    }

    #[test]
    fn color_space_guesses() {
        let mut sps = Sps::default();

        // No color description at all: BT.709 is the default.
        assert_eq!(sps.color_space(), crate::YuvColorSpace::Bt709);

        sps.vui.colour_primaries = 1;
        sps.vui.transfer_characteristics = 1;
        sps.vui.matrix_coefficients = 1;
        assert_eq!(sps.color_space(), crate::YuvColorSpace::Bt709);

        // A single BT.2020 hint is enough.
        sps.vui.colour_primaries = 9;
        sps.vui.transfer_characteristics = 0;
        sps.vui.matrix_coefficients = 0;
        assert_eq!(sps.color_space(), crate::YuvColorSpace::Bt2020);

        // Disagreeing guesses: the wider gamut wins.
        sps.vui.colour_primaries = 9;
        sps.vui.transfer_characteristics = 1;
        sps.vui.matrix_coefficients = 6;
        assert_eq!(sps.color_space(), crate::YuvColorSpace::Bt2020);

        sps.vui.colour_primaries = 5;
        sps.vui.transfer_characteristics = 1;
        sps.vui.matrix_coefficients = 0;
        assert_eq!(sps.color_space(), crate::YuvColorSpace::Bt709);

        sps.vui.colour_primaries = 5;
        sps.vui.transfer_characteristics = 6;
        sps.vui.matrix_coefficients = 0;
        assert_eq!(sps.color_space(), crate::YuvColorSpace::Bt601);
    }

    #[test]
    fn color_depth_fallback() {
        let mut sps = Sps::default();

        sps.bit_depth_luma = 8;
        assert_eq!(sps.color_depth(), crate::ColorDepth::Depth8);
        sps.bit_depth_luma = 10;
        assert_eq!(sps.color_depth(), crate::ColorDepth::Depth10);
        sps.bit_depth_luma = 12;
        assert_eq!(sps.color_depth(), crate::ColorDepth::Depth12);

        // Unusual depths fall back to 8.
        sps.bit_depth_luma = 9;
        assert_eq!(sps.color_depth(), crate::ColorDepth::Depth8);
        sps.bit_depth_luma = 14;
        assert_eq!(sps.color_depth(), crate::ColorDepth::Depth8);
    }

    #[test]
    fn sample_ratio_table() {
        let mut vui = VuiParams::default();
        assert_eq!(vui.sample_ratio(), None);

        vui.aspect_ratio_info_present_flag = true;
        vui.aspect_ratio_idc = 0;
        assert_eq!(vui.sample_ratio(), None);

        vui.aspect_ratio_idc = 14;
        assert_eq!(vui.sample_ratio(), Some(4.0 / 3.0));

        vui.aspect_ratio_idc = super::EXTENDED_SAR;
        vui.sar_width = 2;
        vui.sar_height = 1;
        assert_eq!(vui.sample_ratio(), Some(2.0));

        vui.sar_height = 0;
        assert_eq!(vui.sample_ratio(), None);
    }
}
