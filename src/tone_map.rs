// Copyright 2019 The Glare Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HDR tone mapping: luminance encodings, tone curves, and LUT
//! generation.
//!
//! Luminance moves between four interchangeable encodings ([`Scaling`]).
//! A tone curve maps a source luminance range onto a target range in the
//! curve's native encoding; [`generate`] evaluates a curve over a 1D
//! lookup table and [`sample`] evaluates a single point. Inverse tone
//! mapping (expanding the range) uses the curve's inverse where one
//! exists and falls back to a linear stretch otherwise.

use std::ptr;

/// The SDR reference white level, in cd/m².
pub const SDR_WHITE: f32 = 203.0;

// SMPTE ST 2084 (PQ) constants
const PQ_M1: f32 = 2610.0 / 16384.0;
const PQ_M2: f32 = 2523.0 / 4096.0 * 128.0;
const PQ_C1: f32 = 3424.0 / 4096.0;
const PQ_C2: f32 = 2413.0 / 4096.0 * 32.0;
const PQ_C3: f32 = 2392.0 / 4096.0 * 32.0;

/// A dimensionless encoding of luminance.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Scaling {
    /// Display-relative linear light, 1.0 = SDR reference white.
    Norm,
    /// Square root of [`Scaling::Norm`].
    Sqrt,
    /// Absolute luminance in cd/m².
    Nits,
    /// SMPTE ST 2084 non-linear signal, 0 to 1.
    Pq,
}

/// Convert a luminance value between encodings.
pub fn rescale(from: Scaling, to: Scaling, x: f32) -> f32 {
    if from == to || x == 0.0 {
        return x;
    }

    // convert the input to Norm
    let x = match from {
        Scaling::Pq => {
            let y = x.powf(1.0 / PQ_M2);
            let y = (y - PQ_C1).max(0.0) / (PQ_C2 - PQ_C3 * y);
            y.powf(1.0 / PQ_M1) * 10000.0 / SDR_WHITE
        }
        Scaling::Nits => x / SDR_WHITE,
        Scaling::Norm => x,
        Scaling::Sqrt => x * x,
    };

    // emit Norm into the target encoding
    match to {
        Scaling::Norm => x,
        Scaling::Sqrt => x.sqrt(),
        Scaling::Nits => x * SDR_WHITE,
        Scaling::Pq => {
            let y = (x * SDR_WHITE / 10000.0).powf(PQ_M1);
            let y = (PQ_C1 + PQ_C2 * y) / (1.0 + PQ_C3 * y);
            y.powf(PQ_M2)
        }
    }
}

/// Endpoints handed to a curve, in the curve's native scaling.
#[derive(Clone, Copy, Debug)]
struct CurveParams {
    param: f32,
    input_min: f32,
    input_max: f32,
    output_min: f32,
    output_max: f32,
}

type MapFn = fn(&mut [f32], &CurveParams);

/// A tone-mapping curve. The curves themselves are fixed values
/// registered in [`CURVES`]; parameters vary per use through [`Params`].
#[derive(Debug)]
pub struct Curve {
    /// Short identifier.
    pub name: &'static str,
    /// Human readable description.
    pub description: &'static str,
    /// The encoding the curve operates in.
    pub scaling: Scaling,
    /// What the tunable parameter means, if the curve has one.
    pub param_desc: Option<&'static str>,
    /// Smallest allowed parameter value.
    pub param_min: f32,
    /// Default parameter value.
    pub param_def: f32,
    /// Largest allowed parameter value.
    pub param_max: f32,
    map: Option<MapFn>,
    map_inverse: Option<MapFn>,
}

impl Curve {
    /// Whether the curve can perform inverse tone mapping.
    pub fn has_inverse(&self) -> bool {
        self.map_inverse.is_some()
    }
}

/// Tone-mapping parameters: a curve, its tunable parameter, and the
/// source and target luminance ranges in caller-chosen encodings.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    /// The curve, defaulting to [`CLIP`]. [`AUTO`] selects a curve from
    /// the luminance ranges.
    pub function: Option<&'static Curve>,
    /// Curve parameter, defaulting to the curve's own default.
    pub param: Option<f32>,
    /// Encoding of `input_min` and `input_max`.
    pub input_scaling: Scaling,
    /// Encoding of `output_min` and `output_max`.
    pub output_scaling: Scaling,
    /// Number of entries tone-mapped at a time.
    pub lut_size: usize,
    /// Source black point.
    pub input_min: f32,
    /// Source peak.
    pub input_max: f32,
    /// Target black point.
    pub output_min: f32,
    /// Target peak.
    pub output_max: f32,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            function: None,
            param: None,
            input_scaling: Scaling::Norm,
            output_scaling: Scaling::Norm,
            lut_size: 256,
            input_min: 0.0,
            input_max: 1.0,
            output_min: 0.0,
            output_max: 1.0,
        }
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        let function = match (self.function, other.function) {
            (Some(a), Some(b)) => ptr::eq(a, b),
            (None, None) => true,
            _ => false,
        };
        function
            && self.param == other.param
            && self.input_scaling == other.input_scaling
            && self.output_scaling == other.output_scaling
            && self.lut_size == other.lut_size
            && self.input_min == other.input_min
            && self.input_max == other.input_max
            && self.output_min == other.output_min
            && self.output_max == other.output_max
    }
}

impl Params {
    /// Whether tone mapping with these parameters would leave its input
    /// unchanged: black points coincide, no range reduction, and no range
    /// expansion the curve could act on.
    pub fn is_noop(&self) -> bool {
        let in_min = rescale(self.input_scaling, Scaling::Nits, self.input_min);
        let in_max = rescale(self.input_scaling, Scaling::Nits, self.input_max);
        let out_min = rescale(self.output_scaling, Scaling::Nits, self.output_min);
        let out_max = rescale(self.output_scaling, Scaling::Nits, self.output_max);
        let fun = self.function.unwrap_or(&CLIP);

        (in_min - out_min).abs() < 1e-4
            && in_max < out_max + 1e-2
            && (out_max < in_max + 1e-2 || !fun.has_inverse())
    }
}

/// Canonicalize parameters: apply defaults, resolve [`AUTO`], clamp the
/// parameter to the curve's range, and convert all endpoints to the
/// curve's native scaling.
pub fn fix_params(params: &Params) -> Params {
    let mut fun = params.function.unwrap_or(&CLIP);
    let mut param = params.param.unwrap_or(fun.param_def);

    if ptr::eq(fun, &AUTO) {
        let src_max = rescale(params.input_scaling, Scaling::Norm, params.input_max);
        let dst_max = rescale(params.output_scaling, Scaling::Norm, params.output_max);
        let ratio = src_max / dst_max;
        fun = if ratio > 10.0 {
            // Extreme reduction: spline for its quasi-linear behavior
            &SPLINE
        } else if ratio.max(1.0 / ratio) > 2.0 {
            // Reasonably ranged HDR<->SDR conversion, the task BT.2446a
            // was designed for
            &BT2446A
        } else if ratio < 1.0 {
            // Small range inverse mapping; BT.2446a distorts colors too
            // much here
            &SPLINE
        } else {
            // Nearly a no-op; BT.2390 has the best asymptotic behavior
            &BT2390
        };
        param = fun.param_def;
    }

    Params {
        function: Some(fun),
        param: Some(param.max(fun.param_min).min(fun.param_max)),
        input_scaling: fun.scaling,
        output_scaling: fun.scaling,
        lut_size: params.lut_size,
        input_min: rescale(params.input_scaling, fun.scaling, params.input_min),
        input_max: rescale(params.input_scaling, fun.scaling, params.input_max),
        output_min: rescale(params.output_scaling, fun.scaling, params.output_min),
        output_max: rescale(params.output_scaling, fun.scaling, params.output_max),
    }
}

struct Fixed {
    curve: &'static Curve,
    cp: CurveParams,
}

fn resolve(canonical: &Params) -> Fixed {
    let curve = canonical.function.unwrap_or(&CLIP);
    Fixed {
        curve,
        cp: CurveParams {
            param: canonical.param.unwrap_or(curve.param_def),
            input_min: canonical.input_min,
            input_max: canonical.input_max,
            output_min: canonical.output_min,
            output_max: canonical.output_max,
        },
    }
}

fn map_lut(lut: &mut [f32], fixed: &Fixed) {
    let cp = &fixed.cp;
    if cp.output_max > cp.input_max + 1e-4 {
        // Inverse tone mapping
        if let Some(inv) = fixed.curve.map_inverse {
            inv(lut, cp);
        } else {
            // Linear-stretched black point compensation only
            for x in lut.iter_mut() {
                let mut v = *x - cp.input_min;
                v *= (cp.input_max - cp.output_min) / (cp.input_max - cp.input_min);
                v += cp.output_min;
                *x = v;
            }
        }
    } else if let Some(map) = fixed.curve.map {
        map(lut, cp);
    }
}

/// Fill `out` with the tone-mapping of luminances evenly spaced over the
/// input range. Entry values arrive in the input scaling and leave in the
/// output scaling.
pub fn generate(out: &mut [f32], params: &Params) {
    assert!(out.len() >= 2, "a LUT needs at least two entries");
    assert_eq!(out.len(), params.lut_size, "LUT length disagrees with the parameters");

    let canonical = fix_params(params);
    let fixed = resolve(&canonical);

    let n = out.len();
    for (i, v) in out.iter_mut().enumerate() {
        let t = i as f32 / (n - 1) as f32;
        let x = params.input_min + (params.input_max - params.input_min) * t;
        *v = rescale(params.input_scaling, fixed.curve.scaling, x);
    }

    map_lut(out, &fixed);

    for v in out.iter_mut() {
        let x = v.max(fixed.cp.output_min).min(fixed.cp.output_max);
        *v = rescale(fixed.curve.scaling, params.output_scaling, x);
    }
}

/// Tone-map a single luminance value.
pub fn sample(x: f32, params: &Params) -> f32 {
    let canonical = fix_params(params);
    let fixed = resolve(&canonical);

    let x = x.max(params.input_min).min(params.input_max);
    let mut buf = [rescale(params.input_scaling, fixed.curve.scaling, x)];
    map_lut(&mut buf, &fixed);
    let x = buf[0].max(fixed.cp.output_min).min(fixed.cp.output_max);
    rescale(fixed.curve.scaling, params.output_scaling, x)
}

// Rescale from input-absolute to input-relative
fn rescale_in(x: f32, p: &CurveParams) -> f32 {
    (x - p.input_min) / (p.input_max - p.input_min)
}

// Rescale from input-absolute to output-relative
fn rescale_rel(x: f32, p: &CurveParams) -> f32 {
    (x - p.input_min) / (p.output_max - p.output_min)
}

// Rescale from output-relative to output-absolute
fn rescale_out(x: f32, p: &CurveParams) -> f32 {
    x * (p.output_max - p.output_min) + p.output_min
}

fn bt1886_eotf(x: f32, min: f32, max: f32) -> f32 {
    let lb = min.powf(1.0 / 2.4);
    let lw = max.powf(1.0 / 2.4);
    ((lw - lb) * x + lb).powf(2.4)
}

fn bt1886_oetf(x: f32, min: f32, max: f32) -> f32 {
    let lb = min.powf(1.0 / 2.4);
    let lw = max.powf(1.0 / 2.4);
    (x.powf(1.0 / 2.4) - lb) / (lw - lb)
}

fn noop_map(_lut: &mut [f32], _p: &CurveParams) {}

fn bt2390_map(lut: &mut [f32], p: &CurveParams) {
    let min_lum = rescale_in(p.output_min, p);
    let max_lum = rescale_in(p.output_max, p);
    let offset = p.param;
    let ks = (1.0 + offset) * max_lum - offset;
    let bp = if min_lum > 0.0 { (1.0 / min_lum).min(4.0) } else { 4.0 };
    let gain_inv = 1.0 + min_lum / max_lum * (1.0 - max_lum).powf(bp);
    let gain = if max_lum < 1.0 { 1.0 / gain_inv } else { 1.0 };

    for v in lut.iter_mut() {
        let mut x = rescale_in(*v, p);

        // Piece-wise hermite spline
        if ks < 1.0 {
            let tb = (x - ks) / (1.0 - ks);
            let tb2 = tb * tb;
            let tb3 = tb2 * tb;
            let pb = (2.0 * tb3 - 3.0 * tb2 + 1.0) * ks
                + (tb3 - 2.0 * tb2 + tb) * (1.0 - ks)
                + (-2.0 * tb3 + 3.0 * tb2) * max_lum;
            x = if x < ks { x } else { pb };
        }

        // Black point adaptation
        if x < 1.0 {
            x += min_lum * (1.0 - x).powf(bp);
            x = gain * (x - min_lum) + min_lum;
        }

        *v = x * (p.input_max - p.input_min) + p.input_min;
    }
}

fn bt2446a_map(lut: &mut [f32], p: &CurveParams) {
    let phdr = 1.0 + 32.0 * (p.input_max / 10000.0).powf(1.0 / 2.4);
    let psdr = 1.0 + 32.0 * (p.output_max / 10000.0).powf(1.0 / 2.4);

    for v in lut.iter_mut() {
        let mut x = rescale_in(*v, p).powf(1.0 / 2.4);
        x = (1.0 + (phdr - 1.0) * x).ln() / phdr.ln();

        if x <= 0.7399 {
            x = 1.0770 * x;
        } else if x < 0.9909 {
            x = (-1.1510 * x + 2.7811) * x - 0.6302;
        } else {
            x = 0.5 * x + 0.5;
        }

        x = (psdr.powf(x) - 1.0) / (psdr - 1.0);
        *v = bt1886_eotf(x, p.output_min, p.output_max);
    }
}

fn bt2446a_inv_map(lut: &mut [f32], p: &CurveParams) {
    for v in lut.iter_mut() {
        let mut x = bt1886_oetf(*v, p.input_min, p.input_max);
        x *= 255.0;
        if x > 70.0 {
            x = x.powf((2.8305e-6 * x - 7.4622e-4) * x + 1.2528);
        } else {
            x = x.powf((1.8712e-5 * x - 2.7334e-3) * x + 1.3141);
        }
        x = (x / 1000.0).powf(2.4);
        *v = rescale_out(x, p);
    }
}

fn spline_map(lut: &mut [f32], p: &CurveParams) {
    // Normalize everything to the pivot to make the math easier
    let pivot = p.param;
    let in_min = p.input_min - pivot;
    let in_max = p.input_max - pivot;
    let out_min = p.output_min - pivot;
    let out_max = p.output_max - pivot;

    // Solve P of order 2 for:
    //  P(in_min) = out_min
    //  P'(0.0) = 1.0
    //  P(0.0) = 0.0
    let pa = (out_min - in_min) / (in_min * in_min);

    // Solve Q of order 3 for:
    //  Q(in_max) = out_max
    //  Q''(in_max) = 0.0
    //  Q(0.0) = 0.0
    //  Q'(0.0) = 1.0
    let t = 2.0 * in_max * in_max;
    let qa = (in_max - out_max) / (in_max * t);
    let qb = -3.0 * (in_max - out_max) / t;

    for v in lut.iter_mut() {
        let x = *v - pivot;
        let x = if x > 0.0 { ((qa * x + qb) * x + 1.0) * x } else { (pa * x + 1.0) * x };
        *v = x + pivot;
    }
}

fn reinhard_map(lut: &mut [f32], p: &CurveParams) {
    let peak = rescale_rel(p.input_max, p);
    let contrast = p.param;
    let offset = (1.0 - contrast) / contrast;
    let scale = (peak + offset) / peak;

    for v in lut.iter_mut() {
        let mut x = rescale_rel(*v, p);
        x = x / (x + offset);
        x *= scale;
        *v = rescale_out(x, p);
    }
}

fn mobius_map(lut: &mut [f32], p: &CurveParams) {
    let peak = rescale_rel(p.input_max, p);
    let j = p.param;

    // Solve for M(j) = j; M(peak) = 1.0; M'(j) = 1.0
    // where M(x) = scale * (x+a)/(x+b)
    let a = -j * j * (peak - 1.0) / (j * j - 2.0 * j + peak);
    let b = (j * j - 2.0 * j * peak + peak) / (peak - 1.0).max(1e-6);
    let scale = (b * b + 2.0 * b * j + j * j) / (b - a);

    for v in lut.iter_mut() {
        let x = rescale_rel(*v, p);
        let x = if x <= j { x } else { scale * (x + a) / (x + b) };
        *v = rescale_out(x, p);
    }
}

fn hable(x: f32) -> f32 {
    const A: f32 = 0.15;
    const B: f32 = 0.50;
    const C: f32 = 0.10;
    const D: f32 = 0.20;
    const E: f32 = 0.02;
    const F: f32 = 0.30;
    ((x * (A * x + C * B) + D * E) / (x * (A * x + B) + D * F)) - E / F
}

fn hable_map(lut: &mut [f32], p: &CurveParams) {
    let peak = p.input_max / p.output_max;
    let scale = 1.0 / hable(peak);

    for v in lut.iter_mut() {
        let mut x = bt1886_oetf(*v, p.input_min, p.input_max);
        x = bt1886_eotf(x, 0.0, peak);
        x = scale * hable(x);
        x = bt1886_oetf(x, 0.0, 1.0);
        *v = bt1886_eotf(x, p.output_min, p.output_max);
    }
}

fn gamma_map(lut: &mut [f32], p: &CurveParams) {
    let peak = rescale_rel(p.input_max, p);
    let cutoff = p.param;
    let gamma = cutoff.ln() / (cutoff / peak).ln();

    for v in lut.iter_mut() {
        let x = rescale_rel(*v, p);
        let x = if x > cutoff { (x / peak).powf(gamma) } else { x };
        *v = rescale_out(x, p);
    }
}

fn linear_map(lut: &mut [f32], p: &CurveParams) {
    let gain = p.param;

    for v in lut.iter_mut() {
        let mut x = rescale_in(*v, p);
        x *= gain;
        *v = rescale_out(x, p);
    }
}

/// Meta-curve resolved by [`fix_params`] from the luminance ranges.
pub static AUTO: Curve = Curve {
    name: "auto",
    description: "Automatic selection",
    scaling: Scaling::Norm,
    param_desc: None,
    param_min: 0.0,
    param_def: 0.0,
    param_max: 0.0,
    map: None,
    map_inverse: None,
};

/// No tone mapping; out-of-range values clip.
pub static CLIP: Curve = Curve {
    name: "clip",
    description: "No tone mapping (clip)",
    scaling: Scaling::Norm,
    param_desc: None,
    param_min: 0.0,
    param_def: 0.0,
    param_max: 0.0,
    map: Some(noop_map),
    map_inverse: Some(noop_map),
};

/// ITU-R BT.2390 EETF: hermite spline with black point adaptation.
pub static BT2390: Curve = Curve {
    name: "bt2390",
    description: "ITU-R BT.2390 EETF",
    scaling: Scaling::Pq,
    param_desc: Some("Knee offset"),
    param_min: 0.50,
    param_def: 1.00,
    param_max: 2.00,
    map: Some(bt2390_map),
    map_inverse: None,
};

/// ITU-R BT.2446 method A, designed for HDR<->SDR range conversion.
pub static BT2446A: Curve = Curve {
    name: "bt2446a",
    description: "ITU-R BT.2446 Method A",
    scaling: Scaling::Nits,
    param_desc: None,
    param_min: 0.0,
    param_def: 0.0,
    param_max: 0.0,
    map: Some(bt2446a_map),
    map_inverse: Some(bt2446a_inv_map),
};

/// Two polynomials joined with C¹ continuity at a configurable pivot.
pub static SPLINE: Curve = Curve {
    name: "spline",
    description: "Single-pivot polynomial spline",
    scaling: Scaling::Pq,
    param_desc: Some("Pivot point"),
    param_min: 0.15, // ~1 nits
    param_def: 0.30, // ~10 nits
    param_max: 0.50, // ~100 nits
    map: Some(spline_map),
    map_inverse: Some(spline_map),
};

/// Reinhard, normalized so the input peak maps to 1.
pub static REINHARD: Curve = Curve {
    name: "reinhard",
    description: "Reinhard",
    scaling: Scaling::Norm,
    param_desc: Some("Contrast"),
    param_min: 0.001,
    param_def: 0.50,
    param_max: 0.99,
    map: Some(reinhard_map),
    map_inverse: None,
};

/// Möbius transform, the identity below its knee.
pub static MOBIUS: Curve = Curve {
    name: "mobius",
    description: "Mobius",
    scaling: Scaling::Norm,
    param_desc: Some("Knee point"),
    param_min: 0.00,
    param_def: 0.30,
    param_max: 0.99,
    map: Some(mobius_map),
    map_inverse: None,
};

/// Filmic curve by John Hable, wrapped in BT.1886 transfer in and out.
pub static HABLE: Curve = Curve {
    name: "hable",
    description: "Filmic tone-mapping (Hable)",
    scaling: Scaling::Norm,
    param_desc: None,
    param_min: 0.0,
    param_def: 0.0,
    param_max: 0.0,
    map: Some(hable_map),
    map_inverse: None,
};

/// Identity up to a cutoff, then a power law chosen for continuity.
pub static GAMMA: Curve = Curve {
    name: "gamma",
    description: "Gamma function with knee",
    scaling: Scaling::Norm,
    param_desc: Some("Knee point"),
    param_min: 0.001,
    param_def: 0.50,
    param_max: 1.00,
    map: Some(gamma_map),
    map_inverse: None,
};

/// Linear gain applied in PQ space.
pub static LINEAR: Curve = Curve {
    name: "linear",
    description: "Perceptually linear stretch",
    scaling: Scaling::Pq,
    param_desc: Some("Exposure"),
    param_min: 0.001,
    param_def: 1.00,
    param_max: 10.0,
    map: Some(linear_map),
    map_inverse: Some(linear_map),
};

/// All registered curves.
pub static CURVES: [&Curve; 10] = [
    &AUTO, &CLIP, &BT2390, &BT2446A, &SPLINE, &REINHARD, &MOBIUS, &HABLE, &GAMMA, &LINEAR,
];

/// Look a curve up by name.
pub fn find_curve(name: &str) -> Option<&'static Curve> {
    CURVES.iter().find(|c| c.name == name).copied()
}
