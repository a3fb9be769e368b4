pub mod archive;
pub mod config;
pub mod fetch;
pub mod merge;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod schedule;
pub mod store;
pub mod workdir;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
