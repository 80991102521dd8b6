use std::time::Duration;

use ledger_eth_provider::{transport, Bip32Path, DeviceFilter, DeviceSession, Signer, TransportType};

#[tokio::main]
async fn main() {
    let transport = transport::open(&TransportType::Usb).unwrap_or_else(|e| {
        eprintln!("failed to open transport: {e}");
        std::process::exit(1);
    });
    let mut signer = Signer::new(DeviceSession::new(transport));
    if let Err(e) = signer
        .connect(&DeviceFilter::default(), Duration::from_secs(30))
        .await
    {
        eprintln!("failed to connect: {e}");
        std::process::exit(1);
    }

    match signer.app_configuration().await {
        Ok(config) => println!("{config}"),
        Err(e) => eprintln!("failed to read app configuration: {e}"),
    }

    for index in 0..5 {
        let path = Bip32Path::ethereum(index);
        match signer.get_address(&path, false).await {
            Ok(info) => println!("{path}  {}", info.address.to_checksum(None)),
            Err(e) => eprintln!("{path}: {e}"),
        }
    }
    signer.disconnect().await;
}
