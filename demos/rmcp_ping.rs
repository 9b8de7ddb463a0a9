use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Example:
    //   cargo run --example rmcp_ping -- 192.168.1.10:623
    let mut args = std::env::args().skip(1);
    let target = args.next().ok_or("missing <host:port>")?.parse()?;

    let pong = ipmi_sdr::rmcp::ping(target, Duration::from_secs(2))?;
    println!("Presence Pong: {pong:?}");
    println!("IPMI supported: {}", pong.ipmi_supported);

    Ok(())
}
