use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

use clap::Parser;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use granular::message::{Communicator, ReduceOp, TcpHost};

#[derive(Debug, Parser)]
#[clap(version = "0.1", about = "Pass a token around a ring of TCP ranks on localhost")]
struct Opts {
    #[clap(short = 'r', long, default_value = "8")]
    num_ranks: usize,

    #[clap(short = 'p', long, default_value = "8000")]
    base_port: u16,
}

fn peer(base_port: u16, rank: usize) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), base_port + rank as u16)
}

fn main() {
    let opts = Opts::parse();
    SimpleLogger::new().with_level(LevelFilter::Info).init().unwrap();

    let peers: Vec<_> = (0..opts.num_ranks).map(|rank| peer(opts.base_port, rank)).collect();
    let hosts: Vec<_> = (0..opts.num_ranks)
        .map(|rank| TcpHost::new(rank, peers.clone()).unwrap())
        .collect();

    let procs: Vec<_> = hosts
        .into_iter()
        .map(|(mut host, comm)| {
            thread::spawn(move || {
                let dest = (comm.rank() + 1) % comm.size();
                let source = (comm.rank() + comm.size() - 1) % comm.size();
                let message = format!("hello from {}", comm.rank());
                comm.send(dest, 0, message.into_bytes()).unwrap();

                let received = comm.recv(source, 0).unwrap();
                info!("{} received '{}'", comm.rank(), String::from_utf8_lossy(&received));

                let total = comm.all_reduce_f64(1, &[comm.rank() as f64], ReduceOp::Sum).unwrap();
                if comm.rank() == 0 {
                    info!("sum of ranks is {}", total[0]);
                }
                drop(comm);
                host.join();
            })
        })
        .collect();

    for process in procs {
        process.join().unwrap()
    }
}
