//! tarn CLI - erode heightmap tiles and inspect their pools.

use clap::{Args, Parser, Subcommand};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tarn::erosion::{ErosionMode, ErosionSettings};
use tarn::export::{
    catchment_shades, export_mask_png, export_tile_previews, read_tile, save_tile_buffers,
    write_raw, write_raw_r16,
};
use tarn::noise::{fractal_heightmap, FractalNoiseConfig};
use tarn::pipeline::{ErosionSimulation, TileId};
use tarn::pools::PoolHierarchy;
use tarn::Tile;

/// Hydraulic erosion and pool solving for square heightmap tiles.
#[derive(Parser)]
#[command(name = "tarn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an fBm tile and write it as a raw f32 blob.
    Generate {
        /// Tile resolution in cells.
        #[arg(short, long, default_value = "256")]
        resolution: usize,

        #[arg(short, long, default_value = "42")]
        seed: i32,

        /// Output raw file.
        #[arg(short, long, default_value = "./output/tile.raw")]
        output: PathBuf,

        #[arg(long, default_value = "6")]
        octaves: u8,

        /// Base frequency in cycles per tile.
        #[arg(long, default_value = "3.0")]
        frequency: f32,

        #[arg(long, default_value = "0.5")]
        persistence: f32,

        /// Also write a 16-bit raw for engine import.
        #[arg(long)]
        r16: bool,
    },

    /// Erode a raw tile.
    Erode {
        /// Input raw f32 heightmap.
        input: PathBuf,

        /// Directory for the eroded buffers.
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Base name for output files.
        #[arg(short, long, default_value = "eroded")]
        name: String,

        /// Resolution; inferred from the file length when omitted.
        #[arg(short, long)]
        resolution: Option<usize>,

        #[command(flatten)]
        overrides: SettingsArgs,

        /// Write PNG previews of height, pool and flow.
        #[arg(long)]
        png: bool,

        /// Settle standing water into level pools after the last cycle and print a summary.
        #[arg(long)]
        pools: bool,
    },

    /// Solve the pool hierarchy of a raw tile and print it.
    Pools {
        input: PathBuf,

        #[arg(short, long)]
        resolution: Option<usize>,

        /// Print the drains and pool chain of one cell, as `x,z`.
        #[arg(long, value_parser = parse_cell)]
        inspect: Option<(i32, i32)>,

        /// Write the catchment partition as an 8-bit PNG.
        #[arg(long)]
        catchment_png: Option<PathBuf>,

        /// Print every pool, not just the roots.
        #[arg(long)]
        all: bool,
    },

    /// Print the default settings as JSON.
    Settings,
}

#[derive(Args)]
struct SettingsArgs {
    /// JSON settings file; flags below override it.
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long)]
    cycles: Option<u32>,

    #[arg(long)]
    particles: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Only run thermal erosion; particles move water but carry no sediment.
    #[arg(long)]
    thermal_only: bool,

    #[arg(long)]
    talus: Option<f32>,

    #[arg(long)]
    smoothing: bool,

    /// Tile height in meters.
    #[arg(long)]
    height: Option<f32>,

    /// Tile width in meters.
    #[arg(long)]
    width: Option<f32>,
}

impl SettingsArgs {
    fn resolve(&self) -> ErosionSettings {
        let mut settings = match &self.settings {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .unwrap_or_else(|e| fail(&format!("reading {}", path.display()), e));
                serde_json::from_str(&text)
                    .unwrap_or_else(|e| fail(&format!("parsing {}", path.display()), e))
            }
            None => ErosionSettings::default(),
        };
        if let Some(cycles) = self.cycles {
            settings.cycles = cycles;
        }
        if let Some(particles) = self.particles {
            settings.particles_per_cycle = particles;
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
        }
        if self.thermal_only {
            settings.behavior = ErosionMode::OnlyThermalErosion;
        }
        if let Some(talus) = self.talus {
            settings.thermal.talus = talus;
        }
        if self.smoothing {
            settings.smoothing.enabled = true;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(width) = self.width {
            settings.width = width;
        }
        settings
    }
}

fn parse_cell(s: &str) -> Result<(i32, i32), String> {
    let (x, z) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,z, got '{s}'"))?;
    let x = x.trim().parse().map_err(|e| format!("bad x '{x}': {e}"))?;
    let z = z.trim().parse().map_err(|e| format!("bad z '{z}': {e}"))?;
    Ok((x, z))
}

fn fail(context: &str, err: impl Display) -> ! {
    eprintln!("Error {context}: {err}");
    std::process::exit(1);
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            resolution,
            seed,
            output,
            octaves,
            frequency,
            persistence,
            r16,
        } => {
            let config = FractalNoiseConfig {
                octaves,
                frequency,
                persistence,
                seed,
                ..Default::default()
            };
            run_generate(resolution, &config, &output, r16);
        }
        Commands::Erode {
            input,
            output,
            name,
            resolution,
            overrides,
            png,
            pools,
        } => {
            let settings = overrides.resolve();
            run_erode(&input, resolution, settings, &output, &name, png, pools);
        }
        Commands::Pools {
            input,
            resolution,
            inspect,
            catchment_png,
            all,
        } => {
            run_pools(&input, resolution, inspect, catchment_png.as_deref(), all);
        }
        Commands::Settings => {
            let json = serde_json::to_string_pretty(&ErosionSettings::default())
                .unwrap_or_else(|e| fail("serializing settings", e));
            println!("{json}");
        }
    }
}

fn run_generate(resolution: usize, config: &FractalNoiseConfig, output: &Path, r16: bool) {
    if !(4..=8192).contains(&resolution) {
        fail("in arguments", "resolution must be between 4 and 8192");
    }
    if let Some(dir) = output.parent() {
        std::fs::create_dir_all(dir).unwrap_or_else(|e| fail("creating output directory", e));
    }

    let start = Instant::now();
    let heights = fractal_heightmap(resolution, (0.0, 0.0), config);
    write_raw(output, &heights).unwrap_or_else(|e| fail("writing raw tile", e));
    println!("Wrote {}x{} tile to {}", resolution, resolution, output.display());

    if r16 {
        let path = output.with_extension("r16");
        write_raw_r16(&path, &heights, 0.0, 1.0).unwrap_or_else(|e| fail("writing r16 tile", e));
        println!("Wrote 16-bit copy to {}", path.display());
    }
    println!("Done in {:.2?}", start.elapsed());
}

fn load_tile(input: &Path, resolution: Option<usize>) -> Tile {
    read_tile(input, resolution).unwrap_or_else(|e| fail(&format!("reading {}", input.display()), e))
}

fn run_erode(
    input: &Path,
    resolution: Option<usize>,
    settings: ErosionSettings,
    output: &Path,
    name: &str,
    png: bool,
    pools: bool,
) {
    let tile = load_tile(input, resolution);
    let res = tile.resolution;
    let cycles = settings.cycles;
    println!("tarn - erosion");
    println!("==============");
    println!("Tile: {}x{} from {}", res, res, input.display());
    println!("Cycles: {}, particles per cycle: {}", cycles, settings.particles_per_cycle);

    let start = Instant::now();
    let mut sim = ErosionSimulation::new(TileId::default(), tile, settings)
        .unwrap_or_else(|e| fail("in settings", e));
    let reports = sim
        .run_with_callbacks(
            cycles,
            |i, total| println!("  [{}/{}] cycle", i + 1, total),
            |report| {
                println!(
                    "        {} events, {} piles, {} drained cells, {:.2?}",
                    report.events, report.piled, report.drained_cells, report.elapsed
                )
            },
        )
        .unwrap_or_else(|e| fail("during erosion", e));
    println!("Erosion completed: {} cycles in {:.2?}", reports.len(), start.elapsed());

    if pools {
        let summary = sim.settle_pools().summary();
        println!("Pools: {summary}");
    }

    let (lo, hi) = sim.tile().height_range();
    println!("Height range: [{lo:.4}, {hi:.4}], standing water: {:.4}", sim.tile().total_pool());

    let written = save_tile_buffers(sim.tile(), output, name)
        .unwrap_or_else(|e| fail("writing raw buffers", e));
    for path in &written {
        println!("  Exported {}", path.display());
    }
    if png {
        let previews = export_tile_previews(sim.tile(), output, name)
            .unwrap_or_else(|e| fail("writing previews", e));
        for path in &previews {
            println!("  Exported {}", path.display());
        }
    }
}

fn run_pools(
    input: &Path,
    resolution: Option<usize>,
    inspect: Option<(i32, i32)>,
    catchment_png: Option<&Path>,
    all: bool,
) {
    let tile = load_tile(input, resolution);
    let start = Instant::now();
    let hierarchy = PoolHierarchy::solve(&tile);
    println!("Solved in {:.2?}: {}", start.elapsed(), hierarchy.summary());

    let mut keys: Vec<_> = if all {
        hierarchy.pools().map(|p| p.key).collect()
    } else {
        hierarchy.roots().to_vec()
    };
    keys.sort();
    for key in keys {
        if let Some(pool) = hierarchy.pool(key) {
            println!(
                "  {:<14} order {} minimum {:.4} drain {:.4} at {:<8} capacity {:.4} parent {}",
                key.to_string(),
                pool.order,
                pool.minima_height,
                pool.drain_height,
                pool.index_drain,
                pool.capacity,
                pool.superceded_by
            );
        }
    }

    if let Some((x, z)) = inspect {
        let view = hierarchy.inspect(x, z);
        println!("Cell {} (height {:.4}) owner {:?}", view.cell, view.height, view.owner);
        println!("  minima: {:?}", view.minima);
        let chain: Vec<String> = view.chain.iter().map(|k| k.to_string()).collect();
        println!("  chain:  {}", chain.join(" -> "));
        let peers: Vec<String> = view.peers.iter().map(|k| k.to_string()).collect();
        println!("  peers:  {}", peers.join(", "));
    }

    if let Some(path) = catchment_png {
        let shades = catchment_shades(&hierarchy.catchments);
        export_mask_png(tile.resolution, &shades, path)
            .unwrap_or_else(|e| fail("writing catchment map", e));
        println!("  Exported {}", path.display());
    }
}
