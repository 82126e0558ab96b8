// build with: cargo flamegraph --bin profile --root
use _offset_template_impl::template_offset::{
    add_to_signal, apply_diag_precond, project_signal, ExecContext, FlagSelection, Interval,
    OffsetError, StepGeometry,
};
use ndarray::Array2;

const N_DET: usize = 8;
const N_SAMP: usize = 1_000_000;
const STEP: usize = 250;
const N_ITER: usize = 50;

fn main() -> Result<(), OffsetError> {
    let n_amp = N_SAMP / STEP + 1;
    let geometry = StepGeometry::new(STEP as i64, 0)?;

    let mut det = Array2::<f64>::from_shape_fn((N_DET, N_SAMP), |(d, i)| {
        ((d * 7 + i * 13) % 1009) as f64 * 1e-3
    });
    let flags = Array2::<u8>::from_shape_fn((N_DET, N_SAMP), |(_, i)| (i % 97 == 0) as u8);
    let intervals: Vec<Interval> = (0..N_SAMP / 50_000)
        .map(|v| Interval::new(v * 50_000, v * 50_000 + 49_000))
        .collect();
    let var = vec![0.5; n_amp];

    let ctx = ExecContext::host();
    let mut amps = vec![0.0; n_amp];
    let mut precond = vec![0.0; n_amp];

    // One conjugate-gradient style sweep per iteration: P^T d, M a, d += P a
    for _ in 0..N_ITER {
        amps.fill(0.0);
        for d in 0..N_DET {
            let flagged = FlagSelection::Masked {
                flags: flags.view(),
                index: d,
                mask: 1,
            };
            project_signal(&ctx, d, det.view(), flagged, geometry, &mut amps, &intervals, false)?;
        }
        apply_diag_precond(&ctx, &var, &amps, &mut precond, false)?;
        for d in 0..N_DET {
            add_to_signal(&ctx, geometry, &precond, d, det.view_mut(), &intervals, false)?;
        }
    }

    let checksum: f64 = precond.iter().sum();
    println!("checksum = {checksum}");
    Ok(())
}
