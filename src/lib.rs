// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsers for HEVC (H.265) parameter sets and HVCC container extradata.
//!
//! This crate decodes VPS and SPS NAL units down to the bit level
//! (Exp-Golomb codes, profile-tier-level, scaling lists, short-term
//! reference picture sets, VUI) and provides the container-side helpers a
//! media pipeline needs around them: locating parameter sets inside HVCC
//! extradata, classifying samples as keyframes, and synthesizing a minimal
//! extradata blob from an in-band sample.
//!
//! Pixel data and PPS payloads are out of scope; PPS NAL units are located
//! and copied but never decoded.

pub mod codec;

/// The color space guessed from the VUI color description, expressed in the
/// buckets a video pipeline actually distinguishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum YuvColorSpace {
    Bt601,
    Bt709,
    Bt2020,
}

/// Bit depth of the decoded luma samples.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ColorDepth {
    Depth8,
    Depth10,
    Depth12,
}

impl ColorDepth {
    /// Number of bits per sample.
    pub fn bit_depth(self) -> u32 {
        match self {
            ColorDepth::Depth8 => 8,
            ColorDepth::Depth10 => 10,
            ColorDepth::Depth12 => 12,
        }
    }
}

/// Frame dimensions in luma samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
