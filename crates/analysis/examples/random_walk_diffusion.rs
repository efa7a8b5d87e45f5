//! Diffusion coefficient of a wrapped random walk.
//!
//! Simulates independent random walkers in a cubic periodic box, stores the
//! wrapped coordinates the way a trajectory file would, unfolds them and
//! estimates D from the mean-square displacement. Uniform steps in
//! `[-h, h]` give D = h² / 6 per unit time.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p mdunfold-analysis --example random_walk_diffusion -- \
//!     --atoms 200 --frames 2000 --box 15.0 --step 0.4
//! ```

use mdunfold_analysis::msd::{fit_diffusion, mean_squared_displacement, FitWindow, MsdConfig};
use mdunfold_core::{CellGeometry, Frame, Trajectory, Unfolder};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

struct Args {
    atoms: usize,
    frames: usize,
    box_edge: f64,
    step: f64,
    seed: u64,
}

fn main() {
    let args = parse_args(&std::env::args().collect::<Vec<_>>());

    println!("Random-walk diffusion");
    println!("=====================");
    println!(
        "{} atoms, {} frames, box {:.2}, step {:.3}",
        args.atoms, args.frames, args.box_edge, args.step
    );

    let cell = CellGeometry::cubic(args.box_edge).expect("box edge must be positive");
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed);
    let mut positions: Vec<[f64; 3]> = (0..args.atoms)
        .map(|_| {
            [
                rng.gen_range(0.0..args.box_edge),
                rng.gen_range(0.0..args.box_edge),
                rng.gen_range(0.0..args.box_edge),
            ]
        })
        .collect();

    let mut frames = Vec::with_capacity(args.frames);
    for i in 0..args.frames {
        let wrapped = positions
            .iter()
            .map(|p| {
                [
                    p[0].rem_euclid(args.box_edge),
                    p[1].rem_euclid(args.box_edge),
                    p[2].rem_euclid(args.box_edge),
                ]
            })
            .collect();
        frames.push(Frame::new(i as u64, i as f64, wrapped, cell));
        for p in positions.iter_mut() {
            for x in p.iter_mut() {
                *x += rng.gen_range(-args.step..args.step);
            }
        }
    }

    let unfolded = Unfolder::default().unfold(&frames).expect("unfold failed");
    let trajectory = Trajectory::new(unfolded).expect("unfolded frames out of order");

    let max_lag = (args.frames / 4).max(3);
    let msd = mean_squared_displacement(&trajectory, &MsdConfig::default().with_max_lag(max_lag))
        .expect("MSD failed");
    let fit = fit_diffusion(&msd, FitWindow::default_for(max_lag)).expect("fit failed");

    println!();
    println!("{:>8} {:>14}", "lag", "MSD");
    for k in (0..msd.lags.len()).step_by((max_lag / 10).max(1)) {
        println!("{:>8} {:>14.5}", msd.lags[k], msd.values[k]);
    }
    println!();
    println!("D (fit)      = {:.5}", fit.coefficient);
    println!("D (expected) = {:.5}", args.step * args.step / 6.0);
    println!("r²           = {:.5}", fit.r_squared);
}

fn parse_args(args: &[String]) -> Args {
    let mut parsed = Args {
        atoms: 100,
        frames: 1000,
        box_edge: 10.0,
        step: 0.3,
        seed: 42,
    };
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--atoms", Some(v)) => parsed.atoms = v.parse().expect("--atoms expects an integer"),
            ("--frames", Some(v)) => parsed.frames = v.parse().expect("--frames expects an integer"),
            ("--box", Some(v)) => parsed.box_edge = v.parse().expect("--box expects a number"),
            ("--step", Some(v)) => parsed.step = v.parse().expect("--step expects a number"),
            ("--seed", Some(v)) => parsed.seed = v.parse().expect("--seed expects an integer"),
            (other, _) => {
                eprintln!("Unknown or incomplete argument: {}", other);
                eprintln!("Options: --atoms N --frames N --box L --step H --seed S");
                std::process::exit(1);
            }
        }
        i += 2;
    }
    parsed
}
