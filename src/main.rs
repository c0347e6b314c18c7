use clap::Parser;
use molsurf::{RunContext, SurfaceJob, SurfaceParams};
use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// Mesh a synthetic atom cluster and print the surface statistics
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of atoms in the synthetic cluster
    #[arg(short = 'n', long, default_value_t = 30)]
    atoms: usize,

    /// Seed for the cluster generator
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Probe radius in Angstroms
    #[arg(short = 'r', long = "probe-radius", default_value_t = 1.4)]
    probe_radius: f32,

    /// Surface quality, -3 (miserable) through 4 (impractically fine)
    #[arg(short, long, default_value_t = 0)]
    quality: i32,

    /// Surface type, 0 (solid) through 6 (fully scribed)
    #[arg(short = 't', long = "surface-type", default_value_t = 0)]
    surface_type: i32,

    /// Generate the solvent-accessible surface instead of the excluded one
    #[arg(long)]
    solvent: bool,

    /// Cavity detection mode (0 disables)
    #[arg(long = "cavity-mode", default_value_t = 0)]
    cavity_mode: i32,

    /// Cavity probe radius; negative means probe-radius multiples
    #[arg(long = "cavity-radius", default_value_t = 7.0)]
    cavity_radius: f32,

    /// Cavity adjacency cutoff; negative means cavity-radius-relative
    #[arg(long = "cavity-cutoff", default_value_t = -3.0)]
    cavity_cutoff: f32,

    /// Island cull neighbor threshold (0 disables)
    #[arg(long = "cavity-cull", default_value_t = 10)]
    cavity_cull: i32,

    /// Curvature trim threshold
    #[arg(long = "trim-cutoff", default_value_t = 0.2)]
    trim_cutoff: f32,

    /// Curvature trim neighborhood, in point-separation multiples
    #[arg(long = "trim-factor", default_value_t = 2.0)]
    trim_factor: f32,

    /// Verbosity of the program:
    /// -v for debug and -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    debug!("{args:?}");

    // A loose cluster scaled so the density stays roughly constant as the
    // atom count grows.
    let half_extent = 2.0 * (args.atoms.max(1) as f32).cbrt();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let coords: Vec<Point3<f32>> = (0..args.atoms)
        .map(|_| {
            Point3::new(
                rng.gen_range(-half_extent..=half_extent),
                rng.gen_range(-half_extent..=half_extent),
                rng.gen_range(-half_extent..=half_extent),
            )
        })
        .collect();
    let radii: Vec<f32> = (0..args.atoms).map(|_| rng.gen_range(1.2..2.0)).collect();

    info!(
        n_atoms = args.atoms,
        seed = args.seed,
        probe_radius = args.probe_radius,
        quality = args.quality,
        "meshing synthetic cluster"
    );

    let params = SurfaceParams {
        probe_radius: args.probe_radius,
        quality: args.quality,
        surface_type: args.surface_type,
        surface_solvent: args.solvent,
        cavity_cull: args.cavity_cull,
        cavity_mode: args.cavity_mode,
        cavity_radius: args.cavity_radius,
        cavity_cutoff: args.cavity_cutoff,
        trim_cutoff: args.trim_cutoff,
        trim_factor: args.trim_factor,
    };
    let ctx = RunContext::new();
    let mut job = SurfaceJob::new(coords, radii, None, params);
    match job.run(&ctx) {
        Ok(()) => {
            println!(
                "surface: {} vertices, {} triangles",
                job.result.n_vertices(),
                job.result.n_triangles()
            );
        }
        Err(e) => {
            eprintln!("surface job failed: {e}");
            std::process::exit(1);
        }
    }
}
