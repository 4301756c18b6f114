use std::env;
#[path = "../error.rs"]
mod error;
#[path = "../fpc_codec.rs"]
mod fpc_codec;
use fpc_codec::Fpc2534;

// Small CLI to help debug frames captured off the bridge topics.
// Usage:
//   cargo run --bin decode_frame -- "4,0,18,0,16,0,10,0,64,0,18,0,1,0,129,0,0,0"
// Reads FPC2534_KEY (hex) for encrypted frames, same as the server.
fn main() {
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        eprintln!(
            "Usage: decode_frame <comma-separated-decimal frame>\n\nEnvironment:\n  FPC2534_KEY   hex-encoded 16/32-byte AES-GCM key (optional)\n"
        );
        std::process::exit(2);
    }
    let raw = args.remove(0);
    let bytes = match raw
        .split(',')
        .map(|token| token.trim().parse::<u8>())
        .collect::<Result<Vec<u8>, _>>()
    {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("decode: ERR  bad payload token: {}", e);
            std::process::exit(1);
        }
    };

    let key = env::var("FPC2534_KEY").ok().map(|k| {
        hex::decode(k.trim()).unwrap_or_else(|e| {
            println!("decode: ERR  FPC2534_KEY is not valid hex: {}", e);
            std::process::exit(1);
        })
    });
    let codec = match Fpc2534::new(key.as_deref()) {
        Ok(codec) => codec,
        Err(e) => {
            println!("decode: ERR  {}", e);
            std::process::exit(1);
        }
    };

    match codec.parse_response(&bytes) {
        Ok(response) => {
            println!("decode: OK");
            println!(
                "{}",
                serde_json::to_string_pretty(&response).unwrap_or_default()
            );
        }
        Err(e) => {
            println!("decode: ERR  {}", e);
            std::process::exit(1);
        }
    }
}
