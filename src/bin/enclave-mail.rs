//! enclave-mail CLI — attested mail and enclave calls on a simulated platform
//!
//! Commands:
//!   enclave-mail demo     — attest, establish, exchange mail and nested calls
//!   enclave-mail measure  — print the measurement of an enclave image
//!   enclave-mail config   — print the effective configuration
//!
//! Every command accepts `--config <path>` pointing at a JSON `BridgeConfig`.

use enclave_mail::call::{connect_direct, connect_mail, CallBridge, HandlerError, Side};
use enclave_mail::config::BridgeConfig;
use enclave_mail::mail::{LoopbackHub, MailChannel, MailRouter};
use enclave_mail::registry::SessionRegistry;
use enclave_mail::storage::{SealingKey, SessionStore};
use enclave_mail::tee::{
    AttestationVerifier, ClientIdentity, EphemeralKeyPair, Measurement, MeasurementAllowList,
    PeerIdentity, SimulatedEnclave, SimulatedPlatform,
};
use std::env;
use std::sync::Arc;

const DEMO_ENCLAVE_CODE: &[u8] = b"enclave-mail demo enclave v1";

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        enclave-mail — attested host/enclave messaging        ║
║        Mail streams + re-entrant enclave calls               ║
╚══════════════════════════════════════════════════════════════╝

Usage: enclave-mail <command> [--config <path>] [options]

Commands:
  demo                    Run attestation, mail and nested calls end to end
  measure <image>         Print the measurement of an enclave image file
  config                  Print the effective configuration as JSON
  help                    Show this message

Examples:
  enclave-mail demo
  enclave-mail demo --config bridge.json
  enclave-mail measure enclave.so
  enclave-mail config --config bridge.json
"#
    );
}

fn main() {
    let mut args: Vec<String> = env::args().collect();

    let config = match take_config_path(&mut args) {
        Ok(Some(path)) => match BridgeConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("  {}", e);
                return;
            }
        },
        Ok(None) => BridgeConfig::default(),
        Err(msg) => {
            eprintln!("  {}", msg);
            return;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter.as_str()),
    )
    .format_timestamp_millis()
    .init();

    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "demo" => cmd_demo(&config),
        "measure" => cmd_measure(&args[2..]),
        "config" => cmd_config(&config),
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
        }
    }
}

/// Remove `--config <path>` from `args`
fn take_config_path(args: &mut Vec<String>) -> Result<Option<String>, String> {
    let Some(pos) = args.iter().position(|a| a == "--config") else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        return Err("Usage: --config <path>".to_string());
    }
    let path = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(path))
}

fn cmd_measure(args: &[String]) {
    let path = match args.first() {
        Some(p) => p,
        None => {
            eprintln!("Usage: enclave-mail measure <image>");
            return;
        }
    };

    match std::fs::read(path) {
        Ok(code) => {
            println!("\n  Image:       {}", path);
            println!("  Size:        {} bytes", code.len());
            println!("  Measurement: {}", Measurement::of_code(&code));
        }
        Err(e) => eprintln!("  Cannot read {}: {}", path, e),
    }
}

fn cmd_config(config: &BridgeConfig) {
    match config.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("  {}", e),
    }
}

fn cmd_demo(config: &BridgeConfig) {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║              enclave-mail — Full Demo                        ║
║     Attestation + Session + Mail + Nested Enclave Calls      ║
╚══════════════════════════════════════════════════════════════╝
"#
    );

    // Step 1: Platform and enclave
    println!("Step 1: Loading enclave on the simulated platform...");
    println!("{}", "-".repeat(60));
    let platform = SimulatedPlatform::new();
    let enclave = SimulatedEnclave::load(&platform, DEMO_ENCLAVE_CODE);
    println!("  {}", enclave.summary());
    println!("  Measurement: {}", enclave.measurement());

    let mut allowed: MeasurementAllowList = config.allow_list();
    if allowed.is_empty() {
        println!("  No allowed measurements configured; trusting the demo enclave");
        allowed.insert(*enclave.measurement());
    }
    println!("  Allow-list:  {} measurement(s)", allowed.len());

    // Step 2: Attestation
    println!("\nStep 2: Verifying the enclave's attestation report...");
    println!("{}", "-".repeat(60));
    let verifier = AttestationVerifier::new(platform.verifier());

    let impostor = SimulatedEnclave::load(&platform, b"not the enclave you want");
    let challenge = verifier.challenge();
    let (report, _) = impostor.attest(challenge.nonce());
    match verifier.verify(&report, &allowed, challenge) {
        Ok(_) => println!("  Impostor accepted (its measurement is allowed)"),
        Err(e) => println!("  Impostor rejected: {}", e),
    }

    let challenge = verifier.challenge();
    let (report, enclave_keys) = enclave.attest(challenge.nonce());
    let identity = match verifier.verify(&report, &allowed, challenge) {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("  Attestation failed: {}", e);
            return;
        }
    };
    println!("  Verified:    measurement={}", identity.measurement);
    println!("  Enclave key: {}", hex::encode(identity.public_key.as_bytes()));

    // Step 3: Sessions
    println!("\nStep 3: Establishing mail channels...");
    println!("{}", "-".repeat(60));
    let host_keys = EphemeralKeyPair::generate();
    let host_channel = Arc::new(MailChannel::new(config.padding.clone()));
    let enclave_channel = Arc::new(MailChannel::new(config.padding.clone()));

    if let Err(e) = host_channel.establish(&host_keys, &PeerIdentity::Enclave(identity)) {
        eprintln!("  Host side failed: {}", e);
        return;
    }
    let client = ClientIdentity {
        public_key: host_keys.public_key(),
        nonce: *host_keys.nonce(),
    };
    if let Err(e) = enclave_channel.establish(&enclave_keys, &PeerIdentity::Client(client)) {
        eprintln!("  Enclave side failed: {}", e);
        return;
    }
    println!("  Host:    {}", host_channel.summary());
    println!("  Enclave: {}", enclave_channel.summary());

    // Step 4: Mail routing
    println!("\nStep 4: Routing mail over the loopback transport...");
    println!("{}", "-".repeat(60));
    let hub = LoopbackHub::new();
    let host_registry = Arc::new(SessionRegistry::new());
    host_registry.insert("enclave", host_channel.clone());
    let enclave_registry = Arc::new(SessionRegistry::new());
    enclave_registry.insert("host", enclave_channel.clone());

    let host_router = Arc::new(MailRouter::new(host_registry.clone(), hub.transport("host")));
    let enclave_router = Arc::new(MailRouter::new(enclave_registry, hub.transport("enclave")));
    hub.attach("host", &host_router);
    hub.attach("enclave", &enclave_router);

    let inbox_result = enclave_router.register(
        "inbox",
        Arc::new(|peer: &str, mail: enclave_mail::mail::Mail| {
            println!(
                "  [enclave] mail #{} from {} on '{}': {}",
                mail.sequence_number,
                peer,
                mail.topic,
                String::from_utf8_lossy(&mail.body)
            );
        }),
    );
    if let Err(e) = inbox_result {
        eprintln!("  Cannot register inbox: {}", e);
        return;
    }

    for text in ["hello enclave", "second message", "a somewhat longer third message"] {
        match host_router.send("enclave", "inbox", b"demo", text.as_bytes()) {
            Ok(seq) => println!("  [host] sent mail #{} ({} bytes)", seq, text.len()),
            Err(e) => eprintln!("  [host] send failed: {}", e),
        }
    }
    println!("  Enclave stats: {:?}", enclave_channel.stats());

    // Step 5: Calls over mail
    println!("\nStep 5: Nested enclave calls carried as mail...");
    println!("{}", "-".repeat(60));
    let host_bridge = CallBridge::new(Side::Host);
    let enclave_bridge = CallBridge::with_gate(Side::Enclave, config.enclave_gate);
    register_demo_handlers(&host_bridge, &enclave_bridge);

    if let Err(e) = connect_mail(&host_bridge, &host_router, "enclave")
        .and_then(|_| connect_mail(&enclave_bridge, &enclave_router, "host"))
    {
        eprintln!("  Cannot connect bridges: {}", e);
        return;
    }

    match host_bridge.invoke("total", b"apples,pears,plums") {
        Ok(Some(value)) => println!("  total(apples,pears,plums) = {}", String::from_utf8_lossy(&value)),
        Ok(None) => println!("  total returned nothing"),
        Err(e) => eprintln!("  total failed: {}", e),
    }
    match host_bridge.invoke("total", b"apples,durian") {
        Ok(_) => println!("  total(apples,durian) unexpectedly succeeded"),
        Err(e) => println!("  total(apples,durian) failed as expected: {}", e),
    }
    match host_bridge.invoke("missing", b"") {
        Ok(_) => println!("  missing unexpectedly succeeded"),
        Err(e) => println!("  missing failed as expected: {}", e),
    }
    println!("  Host:    {}", host_channel.summary());
    println!("  Enclave: {}", enclave_channel.summary());

    // Step 6: In-process calls
    println!("\nStep 6: The same handlers over a direct link...");
    println!("{}", "-".repeat(60));
    let direct_host = CallBridge::new(Side::Host);
    let direct_enclave = CallBridge::with_gate(Side::Enclave, config.enclave_gate);
    register_demo_handlers(&direct_host, &direct_enclave);
    connect_direct(&direct_host, &direct_enclave);
    match direct_host.invoke("total", b"pears,plums") {
        Ok(Some(value)) => println!("  total(pears,plums) = {}", String::from_utf8_lossy(&value)),
        Ok(None) => println!("  total returned nothing"),
        Err(e) => eprintln!("  total failed: {}", e),
    }

    // Step 7: Persistence
    println!("\nStep 7: Persisting the host session...");
    println!("{}", "-".repeat(60));
    match &config.store_dir {
        Some(dir) => {
            let run_dir = dir.join(&host_channel.channel_id[..8]);
            let snapshot = match host_channel.snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    eprintln!("  Cannot snapshot session: {}", e);
                    return;
                }
            };
            let saved = SessionStore::open(&run_dir, SealingKey::generate()).and_then(|mut store| {
                store.save("enclave", &snapshot)?;
                Ok(store)
            });
            match saved {
                Ok(store) => println!("  {} ({})", store.summary(), run_dir.display()),
                Err(e) => eprintln!("  Cannot persist session: {}", e),
            }
        }
        None => println!("  No store_dir configured; skipping"),
    }

    host_registry.evict("enclave");
    println!("\n  Host channel after eviction: {:?}", host_channel.state());
    println!("\nDemo complete.");
}

/// Enclave prices a basket by asking the host for each item's price
fn register_demo_handlers(host: &Arc<CallBridge>, enclave: &Arc<CallBridge>) {
    host.register("price", |_, item| {
        let price: u64 = match item {
            b"apples" => 3,
            b"pears" => 4,
            b"plums" => 5,
            _ => {
                return Err(HandlerError::new(
                    "unknown_item",
                    format!("no price for {}", String::from_utf8_lossy(item)),
                ))
            }
        };
        Ok(Some(price.to_be_bytes().to_vec()))
    });

    enclave.register("total", |ctx, basket| {
        let mut total = 0u64;
        for item in basket.split(|b| *b == b',') {
            let reply = ctx.invoke("price", item)?.unwrap_or_default();
            let bytes: [u8; 8] = reply
                .as_slice()
                .try_into()
                .map_err(|_| HandlerError::new("bad_reply", "price is not a u64"))?;
            total += u64::from_be_bytes(bytes);
        }
        Ok(Some(total.to_string().into_bytes()))
    });
}
