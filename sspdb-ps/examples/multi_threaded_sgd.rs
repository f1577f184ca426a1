//! Multi-threaded SGD on an in-process cluster.
//! This example fits a linear model with several worker threads sharing
//! one weight row, and reports loss and throughput.
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sspdb_ps::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const WEIGHT_TABLE: TableID = 0;
const WEIGHT_ROW: RowID = 0;

fn main() {
    env_logger::init();
    let args = Args::parse();
    let model = if args.push {
        ConsistencyModel::SspPush
    } else {
        ConsistencyModel::Ssp
    };
    let cluster = ClusterConfig::default()
        .num_servers(args.servers)
        .num_comm_channels(args.channels)
        .consistency_model(model);
    let bus = Arc::new(CommBus::new());
    let servers = ServerGroup::start(&cluster, Arc::clone(&bus)).unwrap();
    let group = TableGroup::start(0, cluster, bus).unwrap();

    let mut handles: Vec<_> = (0..args.threads)
        .map(|_| group.register_thread().unwrap())
        .collect();
    let config = TableConfig::new(RowKind::Dense, args.dim).staleness(args.staleness);
    let table = group
        .create_table(&handles[0], WEIGHT_TABLE, config)
        .unwrap();
    let truth: Vec<f32> = (0..args.dim).map(|i| (i % 7) as f32 - 3.0).collect();

    let start = Instant::now();
    let losses: Vec<f32> = thread::scope(|s| {
        let workers: Vec<_> = handles
            .iter_mut()
            .enumerate()
            .map(|(idx, handle)| {
                let (args, table, truth) = (&args, &table, &truth);
                s.spawn(move || worker(idx as u64, args, table, handle, truth))
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    let dur = start.elapsed();
    let samples = args.threads * args.clocks * args.batch;
    println!(
        "{} samples cost {:?} microseconds, avg {:.0} samples/s, final loss {:?}",
        samples,
        dur.as_micros(),
        samples as f64 * 1_000_000_000f64 / dur.as_nanos() as f64,
        losses
    );

    for handle in handles {
        group.deregister_thread(handle);
    }
    group.shutdown().unwrap();
    servers.join().unwrap();
}

/// Run SGD for given clocks, returns mean squared error of last batch.
fn worker(seed: u64, args: &Args, table: &ClientTable, handle: &mut ThreadHandle, truth: &[f32]) -> f32 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut loss = 0.0;
    for _ in 0..args.clocks {
        let weights = table.get_row(handle, WEIGHT_ROW).unwrap();
        let mut grad = vec![0f32; args.dim];
        loss = 0.0;
        for _ in 0..args.batch {
            let x: Vec<f32> = (0..args.dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let y: f32 = x.iter().zip(truth).map(|(a, b)| a * b).sum();
            let pred: f32 = x
                .iter()
                .enumerate()
                .map(|(i, a)| a * weights.get(i as ColumnID).unwrap())
                .sum();
            let err = pred - y;
            loss += err * err;
            for (g, a) in grad.iter_mut().zip(&x) {
                *g += err * a;
            }
        }
        loss /= args.batch as f32;
        let scale = -args.learning_rate / (args.batch * args.threads) as f32;
        let deltas: Vec<(ColumnID, f32)> = grad
            .iter()
            .enumerate()
            .map(|(i, g)| (i as ColumnID, g * scale))
            .collect();
        table.batch_inc(handle, WEIGHT_ROW, &deltas).unwrap();
        table.clock(handle).unwrap();
    }
    loss
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// thread number to run SGD
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// number of clocks each thread runs
    #[arg(short, long, default_value = "200")]
    clocks: usize,

    /// samples per clock per thread
    #[arg(short, long, default_value = "32")]
    batch: usize,

    /// dimension of the model
    #[arg(short, long, default_value = "16")]
    dim: usize,

    /// staleness of weight table
    #[arg(long, default_value = "2")]
    staleness: Clock,

    /// learning rate
    #[arg(long, default_value = "0.5")]
    learning_rate: f32,

    /// number of servers
    #[arg(long, default_value = "2")]
    servers: usize,

    /// number of comm channels
    #[arg(long, default_value = "2")]
    channels: usize,

    /// whether to use push mode
    #[arg(short, long)]
    push: bool,
}
