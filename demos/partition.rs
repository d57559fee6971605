use std::fs::File;
use std::thread;

use clap::Parser;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use granular::body::Body;
use granular::collider::Collider;
use granular::config::Config;
use granular::geometry::{Real, Vector3r};
use granular::message::{Communicator, LocalCommunicator, ReduceOp, Tag};
use granular::scene::Scene;
use granular::subdomain::Subdomain;

const TAG_SUMMARY: Tag = 900;

#[derive(Debug, Parser)]
#[clap(version = "0.1", about = "Slab-partitioned spheres drifting between in-process ranks")]
struct Opts {
    #[clap(short = 'r', long, default_value = "4")]
    num_ranks: usize,

    #[clap(short = 'n', long, default_value = "400")]
    num_bodies: usize,

    #[clap(short = 's', long, default_value = "500")]
    num_steps: u64,

    /// CBOR file with a rank configuration
    #[clap(short = 'c', long)]
    config: Option<String>,

    #[clap(short = 'v', long)]
    verbose: bool,
}




/**
 * Spheres on a line along x, drifting with alternating velocities. Rank
 * `r` owns the bodies whose center lies in slab `r` of the unit-width
 * slabs.
 */
struct Model {
    num_bodies: usize,
    num_ranks: usize,
}




// ============================================================================
impl Model {

    fn length(&self) -> Real {
        self.num_ranks as Real
    }

    fn slab(&self, x: Real) -> usize {
        (x.rem_euclid(self.length()).floor() as usize).min(self.num_ranks - 1)
    }

    fn body(&self, id: usize) -> Body {
        let spacing = self.length() / self.num_bodies as Real;
        let x = spacing * (id as Real + 0.5);
        let mut body = Body::sphere(id, Vector3r::new(x, 0.0, 0.0), 0.4 * spacing);
        body.state.vel = Vector3r::new(if id % 2 == 0 { 0.3 } else { -0.2 }, 0.0, 0.0);
        body.subdomain = self.slab(x);
        body
    }
}




// ============================================================================
fn run_rank(comm: LocalCommunicator, model: &Model, config: &Config, num_steps: u64) -> granular::Result<()> {
    let rank = comm.rank();
    let mut scene = Scene::from_config(rank, 1e-3, config)?;
    for id in 0..model.num_bodies {
        scene.insert_body_at(model.body(id));
    }
    let collider = Collider::new(config.verlet_dist);
    collider.update_bounds(&mut scene.bodies);

    let mut sub = Subdomain::new(rank, comm.size(), config.extra_length);
    sub.rederive_ids(&scene.bodies);
    sub.rebuild_partition(&comm, &mut scene)?;

    while scene.iter < num_steps {
        let dt = scene.dt;
        for &id in &sub.ids {
            if let Some(body) = scene.bodies.get_mut(id) {
                body.state.pos += body.state.vel * dt;
                body.state.pos.x = body.state.pos.x.rem_euclid(model.length());
            }
        }
        collider.run(&mut scene.bodies, &mut scene.interactions, &scene.pool, scene.iter);

        if scene.iter % config.migration_interval.max(1) == 0 {
            collider.update_bounds(&mut scene.bodies);
            sub.exchange_step_with_migration(&comm, &mut scene, |b| model.slab(b.state.pos.x))?;
        } else {
            sub.exchange_step(&comm, &mut scene)?;
        }
        scene.advance();
    }

    let owned = comm.all_reduce_f64(TAG_SUMMARY, &[sub.ids.len() as f64], ReduceOp::Sum)?;
    info!(
        "rank {}: {} owned, {} present, {} interactions, {} owned in total",
        rank,
        sub.ids.len(),
        scene.bodies.count(),
        scene.interactions.len(),
        owned[0]
    );

    sub.merge_op(&comm, &mut scene)?;
    if rank == 0 {
        info!("merged scene holds {} bodies", scene.bodies.count());
    }
    Ok(())
}

fn main() {
    let opts = Opts::parse();

    SimpleLogger::new()
        .with_level(if opts.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .init()
        .unwrap();

    let config: Config = match &opts.config {
        Some(path) => ciborium::de::from_reader(File::open(path).unwrap()).unwrap(),
        None => Config {
            extra_length: 0.05,
            ..Default::default()
        },
    };
    info!("{:?}", opts);

    let model = Model {
        num_bodies: opts.num_bodies,
        num_ranks: opts.num_ranks,
    };
    let start = std::time::Instant::now();

    thread::scope(|scope| {
        let procs: Vec<_> = LocalCommunicator::world_with_timeout(opts.num_ranks, config.recv_timeout())
            .into_iter()
            .map(|comm| {
                let (model, config) = (&model, &config);
                scope.spawn(move || run_rank(comm, model, config, opts.num_steps))
            })
            .collect();

        for process in procs {
            process.join().unwrap().unwrap()
        }
    });
    info!("{} steps in {:.3}s", opts.num_steps, start.elapsed().as_secs_f64());
}
