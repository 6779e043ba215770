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

use std::ptr;

use glare::tone_map::{
    self, fix_params, find_curve, generate, rescale, sample, Params, Scaling, SDR_WHITE,
};

const SCALINGS: [Scaling; 4] = [Scaling::Norm, Scaling::Sqrt, Scaling::Nits, Scaling::Pq];

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_close(a: f32, b: f32, eps: f32) {
    assert!((a - b).abs() <= eps, "{} != {} (eps {})", a, b, eps);
}

#[test]
fn rescale_same_scaling_is_identity() {
    init();
    for &s in &SCALINGS {
        for &x in &[0.0, 0.01, 0.5, 1.0, 4.0] {
            assert_eq!(rescale(s, s, x), x);
        }
    }
}

#[test]
fn rescale_zero_is_always_zero() {
    for &from in &SCALINGS {
        for &to in &SCALINGS {
            assert_eq!(rescale(from, to, 0.0), 0.0);
        }
    }
}

#[test]
fn rescale_round_trips() {
    for &from in &SCALINGS {
        for &to in &SCALINGS {
            for &x in &[0.005, 0.1, 0.5, 1.0, 2.0] {
                let there = rescale(from, to, x);
                let back = rescale(to, from, there);
                assert!(
                    (back - x).abs() <= 1e-3 * x.max(1.0),
                    "{:?} -> {:?}: {} came back as {}",
                    from,
                    to,
                    x,
                    back
                );
            }
        }
    }
}

#[test]
fn rescale_known_values() {
    // SDR white is 1.0 display-relative by definition
    assert_close(rescale(Scaling::Nits, Scaling::Norm, SDR_WHITE), 1.0, 1e-6);
    assert_close(rescale(Scaling::Norm, Scaling::Nits, 2.0), 2.0 * SDR_WHITE, 1e-3);
    // sqrt scaling squares inward and roots outward
    assert_close(rescale(Scaling::Norm, Scaling::Sqrt, 4.0), 2.0, 1e-6);
    assert_close(rescale(Scaling::Sqrt, Scaling::Norm, 2.0), 4.0, 1e-6);
    // PQ encodes SDR white around 0.58, and 10000 nits as 1.0
    assert_close(rescale(Scaling::Nits, Scaling::Pq, SDR_WHITE), 0.5807, 1e-3);
    assert_close(rescale(Scaling::Nits, Scaling::Pq, 10000.0), 1.0, 1e-4);
}

fn pq_params(curve: &'static tone_map::Curve, range_in: (f32, f32), range_out: (f32, f32)) -> Params {
    Params {
        function: Some(curve),
        param: None,
        input_scaling: curve.scaling,
        output_scaling: curve.scaling,
        lut_size: 64,
        input_min: range_in.0,
        input_max: range_in.1,
        output_min: range_out.0,
        output_max: range_out.1,
    }
}

fn assert_monotonic(params: &Params) {
    let mut lut = vec![0.0f32; params.lut_size];
    generate(&mut lut, params);
    for w in lut.windows(2) {
        let slack = 1e-4 * w[0].abs().max(1.0);
        assert!(w[1] >= w[0] - slack, "LUT not monotonic: {} then {}", w[0], w[1]);
    }
}

#[test]
fn linear_identity_lut() {
    init();
    // gain 1.0 over identical PQ ranges must be the identity
    let params = pq_params(&tone_map::LINEAR, (0.0, 1.0), (0.0, 1.0));
    let mut lut = vec![0.0f32; 64];
    generate(&mut lut, &params);

    for (i, &v) in lut.iter().enumerate() {
        let expect = i as f32 / 63.0;
        assert_close(v, expect, 1e-6);
    }
    for w in lut.windows(2) {
        assert!(w[1] > w[0], "identity LUT must be strictly increasing");
    }
}

#[test]
fn auto_resolves_to_spline_for_extreme_reduction() {
    // 10000 nits down to 100 nits: ratio 100
    let params = Params {
        function: Some(&tone_map::AUTO),
        input_scaling: Scaling::Nits,
        output_scaling: Scaling::Nits,
        input_max: 10000.0,
        output_max: 100.0,
        ..Params::default()
    };
    let fixed = fix_params(&params);
    assert!(ptr::eq(fixed.function.unwrap(), &tone_map::SPLINE));
    assert_eq!(fixed.input_scaling, Scaling::Pq);
    assert_eq!(fixed.output_scaling, Scaling::Pq);
}

#[test]
fn auto_selection_by_ratio() {
    let mk = |input_max: f32, output_max: f32| Params {
        function: Some(&tone_map::AUTO),
        input_scaling: Scaling::Nits,
        output_scaling: Scaling::Nits,
        input_max,
        output_max,
        ..Params::default()
    };

    // near-unity ratio
    let fixed = fix_params(&mk(203.0, 203.0));
    assert!(ptr::eq(fixed.function.unwrap(), &tone_map::BT2390));
    // ordinary HDR -> SDR
    let fixed = fix_params(&mk(1000.0, 203.0));
    assert!(ptr::eq(fixed.function.unwrap(), &tone_map::BT2446A));
    // inverse mapping
    let fixed = fix_params(&mk(100.0, 203.0));
    assert!(ptr::eq(fixed.function.unwrap(), &tone_map::SPLINE));
}

#[test]
fn fix_params_applies_defaults_and_clamps() {
    let params = Params {
        function: Some(&tone_map::REINHARD),
        param: Some(5.0),
        ..Params::default()
    };
    let fixed = fix_params(&params);
    assert_eq!(fixed.param, Some(tone_map::REINHARD.param_max));

    let params = Params::default();
    let fixed = fix_params(&params);
    assert!(ptr::eq(fixed.function.unwrap(), &tone_map::CLIP));
}

#[test]
fn fix_params_converts_endpoints_to_curve_scaling() {
    let params = Params {
        function: Some(&tone_map::BT2446A), // native scaling is nits
        input_max: 1.0,                     // 1.0 norm == SDR white
        ..Params::default()
    };
    let fixed = fix_params(&params);
    assert_eq!(fixed.input_scaling, Scaling::Nits);
    assert_close(fixed.input_max, SDR_WHITE, 1e-3);
}

#[test]
fn noop_detection() {
    // identical ranges with clip: nothing to do
    assert!(Params::default().is_noop());

    // range reduction is real work
    let reduction = Params {
        output_max: 0.5,
        ..Params::default()
    };
    assert!(!reduction.is_noop());

    // range expansion with an invertible curve is real work
    let expansion = Params {
        function: Some(&tone_map::CLIP),
        input_max: 0.5,
        output_max: 1.0,
        ..Params::default()
    };
    assert!(!expansion.is_noop());

    // but a curve with no inverse cannot act on an expansion
    let expansion = Params {
        function: Some(&tone_map::REINHARD),
        input_max: 0.5,
        output_max: 1.0,
        ..Params::default()
    };
    assert!(expansion.is_noop());
}

#[test]
fn params_equality_is_field_wise() {
    let a = Params {
        function: Some(&tone_map::SPLINE),
        ..Params::default()
    };
    let b = Params {
        function: Some(&tone_map::SPLINE),
        ..Params::default()
    };
    assert_eq!(a, b);

    let c = Params {
        function: Some(&tone_map::BT2390),
        ..Params::default()
    };
    assert_ne!(a, c);

    let d = Params {
        param: Some(0.3),
        ..a
    };
    assert_ne!(a, d);
}

#[test]
fn spline_maps_endpoints_and_pivot_exactly() {
    let params = pq_params(&tone_map::SPLINE, (0.2, 0.9), (0.3, 0.6));
    // default pivot of 0.3 is a fixed point of the spline
    assert_close(sample(0.3, &params), 0.3, 1e-5);
    assert_close(sample(0.2, &params), 0.3, 1e-5);
    assert_close(sample(0.9, &params), 0.6, 1e-5);
    assert_monotonic(&params);
}

#[test]
fn spline_round_trips_through_its_inverse() {
    let fwd = pq_params(&tone_map::SPLINE, (0.2, 0.9), (0.2, 0.8));
    let inv = pq_params(&tone_map::SPLINE, (0.2, 0.8), (0.2, 0.9));
    for i in 0..=20 {
        let x = 0.2 + 0.7 * i as f32 / 20.0;
        let y = sample(x, &fwd);
        let back = sample(y, &inv);
        assert!(
            (back - x).abs() < 0.02,
            "spline round trip drifted: {} -> {} -> {}",
            x,
            y,
            back
        );
    }
}

#[test]
fn bt2390_is_identity_below_the_knee() {
    let params = pq_params(&tone_map::BT2390, (0.0, 1.0), (0.0, 0.7));
    // ks = (1 + 1) * 0.7 - 1 = 0.4; below it nothing changes
    assert_close(sample(0.2, &params), 0.2, 1e-5);
    assert_close(sample(0.39, &params), 0.39, 1e-4);
    // the peak lands exactly on the output peak
    assert_close(sample(1.0, &params), 0.7, 1e-5);
    assert_monotonic(&params);
}

#[test]
fn bt2390_adapts_the_black_point() {
    let params = pq_params(&tone_map::BT2390, (0.0, 1.0), (0.1, 0.7));
    // source black rises to the target black point
    assert_close(sample(0.0, &params), 0.1, 1e-5);
    assert_monotonic(&params);
}

#[test]
fn reinhard_normalizes_the_peak() {
    let params = Params {
        function: Some(&tone_map::REINHARD),
        input_max: 4.0,
        ..Params::default()
    };
    assert_close(sample(4.0, &params), 1.0, 1e-5);
    assert_close(sample(0.0, &params), 0.0, 1e-6);
    assert_monotonic(&Params { lut_size: 64, ..params });
}

#[test]
fn mobius_is_identity_below_the_knee() {
    let params = Params {
        function: Some(&tone_map::MOBIUS),
        input_max: 2.0,
        ..Params::default()
    };
    // knee defaults to 0.3 in output-relative space
    assert_close(sample(0.2, &params), 0.2, 1e-5);
    assert_close(sample(2.0, &params), 1.0, 1e-3);
    assert_monotonic(&Params { lut_size: 64, ..params });
}

#[test]
fn gamma_is_identity_below_the_cutoff() {
    let params = Params {
        function: Some(&tone_map::GAMMA),
        input_max: 2.0,
        ..Params::default()
    };
    assert_close(sample(0.3, &params), 0.3, 1e-5);
    assert_close(sample(2.0, &params), 1.0, 1e-4);
    assert_monotonic(&Params { lut_size: 64, ..params });
}

#[test]
fn hable_maps_the_peak_to_the_output_peak() {
    let params = Params {
        function: Some(&tone_map::HABLE),
        input_max: 4.0,
        ..Params::default()
    };
    assert_close(sample(4.0, &params), 1.0, 1e-3);
    assert_monotonic(&Params { lut_size: 64, ..params });
}

#[test]
fn bt2446a_compresses_into_the_output_range() {
    let params = Params {
        function: Some(&tone_map::BT2446A),
        input_scaling: Scaling::Nits,
        output_scaling: Scaling::Nits,
        lut_size: 64,
        input_min: 0.1,
        input_max: 1000.0,
        output_min: 0.1,
        output_max: 203.0,
        ..Params::default()
    };
    assert_close(sample(1000.0, &params), 203.0, 0.5);
    let mut lut = vec![0.0f32; 64];
    generate(&mut lut, &params);
    for &v in &lut {
        assert!(v >= 0.1 - 1e-3 && v <= 203.0 + 1e-3);
    }
    assert_monotonic(&params);
}

#[test]
fn bt2446a_inverse_expands_the_range() {
    let params = Params {
        function: Some(&tone_map::BT2446A),
        input_scaling: Scaling::Nits,
        output_scaling: Scaling::Nits,
        lut_size: 64,
        input_min: 0.0,
        input_max: 203.0,
        output_min: 0.0,
        output_max: 1000.0,
        ..Params::default()
    };
    let peak = sample(203.0, &params);
    assert!(
        (peak - 1000.0).abs() < 10.0,
        "inverse peak should reach ~1000 nits, got {}",
        peak
    );
    assert_monotonic(&params);
}

#[test]
fn expansion_without_inverse_falls_back_to_linear_stretch() {
    let params = Params {
        function: Some(&tone_map::REINHARD),
        input_min: 0.2,
        input_max: 1.0,
        output_min: 0.1,
        output_max: 2.0,
        ..Params::default()
    };
    // stretch: (x - in_min) * (in_max - out_min) / (in_max - in_min) + out_min
    assert_close(sample(0.6, &params), 0.55, 1e-5);
}

#[test]
fn clip_clamps_to_the_output_range() {
    let params = Params {
        input_max: 2.0,
        ..Params::default()
    };
    assert_close(sample(1.5, &params), 1.0, 1e-6);
    assert_close(sample(0.5, &params), 0.5, 1e-6);
}

#[test]
fn sample_agrees_with_generate() {
    let params = pq_params(&tone_map::BT2390, (0.0, 1.0), (0.0, 0.7));
    let n = params.lut_size;
    let mut lut = vec![0.0f32; n];
    generate(&mut lut, &params);
    for (i, &v) in lut.iter().enumerate() {
        let x = i as f32 / (n - 1) as f32;
        assert_close(sample(x, &params), v, 1e-5);
    }
}

#[test]
fn curve_registry_lookup() {
    assert!(ptr::eq(find_curve("spline").unwrap(), &tone_map::SPLINE));
    assert!(ptr::eq(find_curve("clip").unwrap(), &tone_map::CLIP));
    assert!(find_curve("nonesuch").is_none());
    assert_eq!(tone_map::CURVES.len(), 10);
    assert!(tone_map::SPLINE.has_inverse());
    assert!(!tone_map::BT2390.has_inverse());
}
