use ipmi_sdr::sdr::SdrCacheReader;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Example:
    //   cargo run --example read_sdr_cache -- /tmp/bmc.sdr [--thresholds]
    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("missing <cache file>")?;
    let thresholds_only = args.next().as_deref() == Some("--thresholds");

    let reader = SdrCacheReader::open(&path)?;
    println!("Header: {:?}", reader.header());

    let records: Box<dyn Iterator<Item = ipmi_sdr::Result<_>>> = if thresholds_only {
        Box::new(reader.threshold_sensors())
    } else {
        Box::new(reader.records())
    };
    for record in records {
        let record = record?;
        match record.sensor_number() {
            Some(number) => println!(
                "{:#06x} {} sensor {number:#04x}",
                record.record_id(),
                record.record_type().description()
            ),
            None => println!(
                "{:#06x} {}",
                record.record_id(),
                record.record_type().description()
            ),
        }
    }

    Ok(())
}
