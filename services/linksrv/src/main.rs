//! PLC Device Link Service (linksrv)
//!
//! Polls Modbus, S7 and OPC UA devices and stores their readings.

use clap::Parser;

use errors::PlcLinkResult;
use linksrv::bootstrap::{self, Args};

#[tokio::main]
async fn main() -> PlcLinkResult<()> {
    let args = Args::parse();
    bootstrap::run(args).await
}
