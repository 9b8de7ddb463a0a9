use std::time::Duration;

use ipmi_sdr::sdr::{CreateMode, SdrCacheBuilder, ValidationFlags};
use ipmi_sdr::{Client, PrivilegeLevel};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Example:
    //   cargo run --example create_sdr_cache -- 192.168.1.10:623 admin password /tmp/bmc.sdr
    let mut args = std::env::args().skip(1);
    let target = args.next().ok_or("missing <host:port>")?.parse()?;
    let username = args.next().ok_or("missing <username>")?;
    let password = args.next().ok_or("missing <password>")?;
    let path = args.next().ok_or("missing <cache file>")?;

    let client = Client::builder(target)
        .username(username)
        .password(password)
        .privilege_level(PrivilegeLevel::User)
        .timeout(Duration::from_secs(2))
        .retries(3)
        .build()?;
    println!("Cipher suite: {:?}", client.cipher_suite());

    let info = client.sdr().repository_info()?;
    println!("Repository: {info:?}");

    let mut fetched = 0u32;
    let summary = SdrCacheBuilder::new()
        .mode(CreateMode::Overwrite)
        .validation(ValidationFlags::ALL)
        .on_record(|header, record| {
            fetched += 1;
            println!(
                "  {:#06x} {:<36} ({}/{})",
                record.record_id(),
                record.record_type().description(),
                fetched,
                header.record_count,
            );
        })
        .create(&client, &path)?;
    println!(
        "Wrote {} records ({} bytes) to {path}",
        summary.records_written, summary.bytes_written
    );

    client.close_session()?;
    Ok(())
}
