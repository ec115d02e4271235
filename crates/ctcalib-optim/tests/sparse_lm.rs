//! End-to-end solves of small gyroscope problems on a synthetic trajectory.

use std::collections::HashMap;

use ctcalib_core::synthetic::{SyntheticMotion, UniformNoise};
use ctcalib_core::{quat_from_slice, quat_to_array, so3_exp, Extrinsic, Vec3};
use ctcalib_optim::{
    BackendSolveOptions, FactorKind, FixedMask, IterationSummary, ManifoldKind, OptimBackend,
    ParamSnapshot, ProblemIR, ResidualBlock, RobustLoss, SegmentTime, SparseLmBackend,
};
use nalgebra::DVector;

struct GyroProblem {
    ir: ProblemIR,
    init: HashMap<String, DVector<f64>>,
}

/// Orientation knots fixed to the truth; extrinsic rotation and bias free.
fn gyro_problem(motion: &SyntheticMotion, ext: &Extrinsic, bias: Vec3, loss: RobustLoss) -> GyroProblem {
    let so3 = &motion.bundle.so3;
    let mut ir = ProblemIR::new();
    let mut init = HashMap::new();

    let knot_ids: Vec<_> = so3
        .knots()
        .iter()
        .enumerate()
        .map(|(i, q)| {
            let name = format!("so3_knot_{i}");
            init.insert(name.clone(), DVector::from_column_slice(&quat_to_array(q)));
            ir.add_param_block(name, 4, ManifoldKind::SO3, FixedMask::all_fixed(4), None)
        })
        .collect();
    let ext_id = ir.add_param_block("so3_imu_to_body", 4, ManifoldKind::SO3, FixedMask::all_free(), None);
    init.insert(
        "so3_imu_to_body".to_string(),
        DVector::from_column_slice(&[0.0, 0.0, 0.0, 1.0]),
    );
    let to_id = ir.add_param_block("time_offset", 1, ManifoldKind::Euclidean, FixedMask::all_fixed(1), None);
    init.insert("time_offset".to_string(), DVector::zeros(1));
    let bias_id = ir.add_param_block("gyro_bias", 3, ManifoldKind::Euclidean, FixedMask::all_free(), None);
    init.insert("gyro_bias".to_string(), DVector::zeros(3));

    let frames = motion.imu_frames(
        motion.min_time() + 0.05,
        motion.max_time() - 0.05,
        50.0,
        ext,
        0.0,
        UniformNoise::none(),
    );
    for (k, frame) in frames.iter().enumerate() {
        let Some((idx, _)) = so3.segment(frame.timestamp) else {
            continue;
        };
        let mut gyro = frame.gyro + bias;
        // a few corrupted readings
        if loss != RobustLoss::None && k % 37 == 5 {
            gyro += Vec3::new(3.0, -2.0, 1.0);
        }
        let factor = FactorKind::ImuGyro {
            t: frame.timestamp,
            gyro: gyro.into(),
            so3_seg: SegmentTime {
                t0: so3.grid().segment_start(idx),
                dt: so3.dt(),
            },
            w: 1.0,
        };
        let mut params = knot_ids[idx..idx + 4].to_vec();
        params.extend([ext_id, to_id, bias_id]);
        ir.add_residual_block(ResidualBlock::new(factor, params, loss));
    }
    GyroProblem { ir, init }
}

fn truth() -> (SyntheticMotion, Extrinsic, Vec3) {
    let motion = SyntheticMotion::new(0.0, 6.0, 0.4);
    let ext = Extrinsic {
        so3: so3_exp(&Vec3::new(0.15, -0.1, 0.25)),
        pos: Vec3::zeros(),
    };
    (motion, ext, Vec3::new(0.02, -0.01, 0.015))
}

#[test]
fn recovers_gyro_extrinsic_and_bias() {
    let (motion, ext, bias) = truth();
    let problem = gyro_problem(&motion, &ext, bias, RobustLoss::None);

    let sol = SparseLmBackend::new(2)
        .solve(&problem.ir, &problem.init, &BackendSolveOptions::default(), &mut [])
        .expect("solve");

    assert!(sol.final_cost < sol.initial_cost);
    assert!(sol.final_cost < 1e-12, "final cost {}", sol.final_cost);
    let q = quat_from_slice(sol.params["so3_imu_to_body"].as_slice());
    assert!(q.angle_to(&ext.so3) < 1e-5, "rotation error {}", q.angle_to(&ext.so3));
    let b = &sol.params["gyro_bias"];
    assert!((Vec3::new(b[0], b[1], b[2]) - bias).norm() < 1e-6);
    // fixed blocks are returned untouched
    assert_eq!(sol.params["time_offset"][0], 0.0);
    assert_eq!(
        sol.params["so3_knot_3"].as_slice(),
        &quat_to_array(&motion.bundle.so3.knots()[3])
    );
}

#[test]
fn callbacks_see_every_iteration() {
    let (motion, ext, bias) = truth();
    let problem = gyro_problem(&motion, &ext, bias, RobustLoss::None);

    let mut summaries: Vec<IterationSummary> = Vec::new();
    let mut last_bias: Option<DVector<f64>> = None;
    let mut record = |s: &IterationSummary, p: &ParamSnapshot<'_>| {
        summaries.push(*s);
        last_bias = p.get("gyro_bias").cloned();
    };
    let sol = SparseLmBackend::new(1)
        .solve(&problem.ir, &problem.init, &BackendSolveOptions::default(), &mut [&mut record])
        .expect("solve");

    assert_eq!(summaries.len(), sol.iterations);
    assert!(!summaries.is_empty());
    for (i, s) in summaries.iter().enumerate() {
        assert_eq!(s.iteration, i);
    }
    let accepted: Vec<f64> = summaries
        .iter()
        .filter(|s| s.step_accepted)
        .map(|s| s.cost)
        .collect();
    assert!(accepted.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(last_bias.as_ref(), Some(&sol.params["gyro_bias"]));
}

#[test]
fn cauchy_loss_tolerates_corrupted_readings() {
    let (motion, ext, bias) = truth();
    let problem = gyro_problem(&motion, &ext, bias, RobustLoss::Cauchy { scale: 0.05 });

    let sol = SparseLmBackend::default()
        .solve(&problem.ir, &problem.init, &BackendSolveOptions::default(), &mut [])
        .expect("solve");

    let q = quat_from_slice(sol.params["so3_imu_to_body"].as_slice());
    assert!(q.angle_to(&ext.so3) < 1e-2, "rotation error {}", q.angle_to(&ext.so3));
}

#[test]
fn fully_fixed_problem_returns_initial_values() {
    let mut ir = ProblemIR::new();
    ir.add_param_block("bias", 3, ManifoldKind::Euclidean, FixedMask::all_fixed(3), None);
    let mut init = HashMap::new();
    init.insert("bias".to_string(), DVector::from_vec(vec![1.0, 2.0, 3.0]));

    let sol = SparseLmBackend::default()
        .solve(&ir, &init, &BackendSolveOptions::default(), &mut [])
        .expect("solve");
    assert_eq!(sol.iterations, 0);
    assert_eq!(sol.params["bias"], init["bias"]);
}

#[test]
fn missing_initial_value_is_an_error() {
    let mut ir = ProblemIR::new();
    ir.add_param_block("bias", 3, ManifoldKind::Euclidean, FixedMask::all_free(), None);
    let err = SparseLmBackend::default()
        .solve(&ir, &HashMap::new(), &BackendSolveOptions::default(), &mut [])
        .unwrap_err();
    assert!(err.to_string().contains("bias"));
}
