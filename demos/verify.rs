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

    let path = Bip32Path::ethereum(0);
    println!("verify address on device for {path}...");
    match signer.get_address(&path, true).await {
        Ok(info) => {
            println!("pubkey:  {}", info.public_key_hex());
            println!("address: {}", info.address.to_checksum(None));
        }
        Err(e) => eprintln!("verification failed: {e}"),
    }
    signer.disconnect().await;
}
