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
    let message = b"Hi, this is my wallet";

    match signer.sign_message(&path, message).await {
        Ok(sig) => println!("signature: {sig}"),
        Err(e) => eprintln!("signing failed: {e}"),
    }
    signer.disconnect().await;
}
