use gatehouse::echo::EchoExecutor;
use gatehouse::{Server, ServerConfig};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // An echo server with a tiny quota and an admin port, then a clean stop.
    let config = ServerConfig {
        port: 0,
        admin_port: Some(0),
        max_connections: 2,
        shutdown_grace_period_ms: 500,
        ..ServerConfig::default()
    };

    let server = Server::builder()
        .with_config(config)
        .with_executor(Arc::new(EchoExecutor::default()))
        .start()?;
    let addr = server.local_addr().ok_or("no primary socket")?;

    let mut client = TcpStream::connect(addr)?;
    let mut reader = BufReader::new(client.try_clone()?);
    writeln!(client, "hello gatehouse")?;
    let mut reply = String::new();
    reader.read_line(&mut reply)?;
    println!("echo: {}", reply.trim_end());

    println!("stats: {:?}", server.stats());
    server.shutdown();
    let report = server.wait();
    println!("stopped in {:?}, {} forced", report.elapsed, report.forced_closed);
    Ok(())
}
