//! Command-line tool for Calypso secure session computations
//!
//! This binary runs the terminal side of a secure session, or ciphers a PIN
//! block, from hex arguments. It never talks to a card: APDU payloads and
//! card challenges are supplied on the command line.

use calypso_crypto::constants::kif;
use calypso_crypto::{ProductType, SessionConfig, SessionContext, SoftwareKeyStore};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hex::FromHex;
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct KeyArgs {
    /// Base key (16 bytes, hex)
    #[arg(short, long)]
    key: String,

    /// Key identifier
    #[arg(long, value_parser = parse_byte, default_value = "0x21")]
    kif: u8,

    /// Key version
    #[arg(long, value_parser = parse_byte, default_value = "0x79")]
    kvc: u8,

    /// Key diversifier, usually the card serial number (hex)
    #[arg(short, long)]
    diversifier: String,

    /// Card challenge returned by Get Challenge (hex)
    #[arg(short, long)]
    card_challenge: String,

    /// Card product type
    #[arg(short, long, value_enum, default_value = "prime3")]
    product: Product,

    /// Seed for the terminal challenge, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the terminal side of a secure session
    Session {
        #[command(flatten)]
        keys: KeyArgs,

        /// Open Secure Session response data (hex)
        #[arg(short, long)]
        open_session: String,

        /// Session payloads in exchange order: request, response, request... (hex)
        #[arg(short, long)]
        apdu: Vec<String>,

        /// Cipher session traffic from the first exchange
        #[arg(short, long)]
        encrypted: bool,

        /// Card certificate from the Close Secure Session response to verify (hex)
        #[arg(short = 'm', long)]
        card_mac: Option<String>,
    },

    /// Cipher a PIN presentation or modification block
    Pin {
        #[command(flatten)]
        keys: KeyArgs,

        /// Current PIN (4 ASCII digits)
        #[arg(long)]
        pin: String,

        /// New PIN, to build a modification block (4 ASCII digits)
        #[arg(long)]
        new_pin: Option<String>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Product {
    /// Calypso Prime revision 1
    Prime1,
    /// Calypso Prime revision 2
    Prime2,
    /// Calypso Prime revision 3
    Prime3,
    /// Calypso Prime revision 3, extended mode
    Prime3Extended,
    /// Calypso Light
    Light,
    /// Calypso Basic
    Basic,
}

impl From<Product> for ProductType {
    fn from(product: Product) -> Self {
        match product {
            Product::Prime1 => Self::PrimeRevision1,
            Product::Prime2 => Self::PrimeRevision2,
            Product::Prime3 => Self::PrimeRevision3,
            Product::Prime3Extended => Self::PrimeRevision3Extended,
            Product::Light => Self::Light,
            Product::Basic => Self::Basic,
        }
    }
}

fn parse_byte(value: &str) -> Result<u8, String> {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .map_or_else(|| value.parse(), |hex| u8::from_str_radix(hex, 16))
        .map_err(|e| format!("invalid byte value {value}: {e}"))
}

fn parse_hex(value: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    Ok(Vec::from_hex(value.replace(' ', ""))?)
}

impl KeyArgs {
    fn open(
        &self,
        config: SessionConfig,
    ) -> Result<SessionContext<SoftwareKeyStore>, Box<dyn std::error::Error>> {
        let key = <[u8; 16]>::from_hex(self.key.replace(' ', ""))
            .map_err(|_| "Key must be 16 bytes (32 hex characters)")?;
        let store = SoftwareKeyStore::new().with_key(self.kif, self.kvc, key);

        let config = config.with_product_type(self.product.into());
        let rng = self
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        let mut session = SessionContext::with_rng(store, config, rng);

        session.set_key_diversifier(&parse_hex(&self.diversifier)?)?;
        let terminal_challenge =
            session.init_terminal_secure_session_context(&parse_hex(&self.card_challenge)?)?;
        let terminal_challenge = hex::encode_upper(terminal_challenge);
        println!("Terminal challenge: {terminal_challenge}");

        Ok(session)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the tracing logger with env_format and ansi
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Session {
            keys,
            open_session,
            apdu,
            encrypted,
            card_mac,
        } => {
            if keys.kif != kif::ISSUER {
                tracing::warn!(kif = keys.kif, "Session key is not the issuer key");
            }

            let config = SessionConfig::new().with_session_encrypted(encrypted);
            let mut session = keys.open(config)?;
            session.init_terminal_session_mac(&parse_hex(&open_session)?, keys.kif, keys.kvc)?;

            for (i, payload) in apdu.iter().enumerate() {
                let direction = ["request", "response"][i % 2];
                let transformed = session.update_terminal_session_mac(&parse_hex(payload)?)?;
                let shown = transformed.map_or_else(|| "plaintext".to_owned(), hex::encode_upper);
                println!("{direction} {}: {shown}", i / 2 + 1);
            }

            let certificate = session.finalize_terminal_session_mac()?;
            println!("Terminal certificate: {}", hex::encode_upper(certificate));

            if let Some(card_mac) = card_mac {
                if session.verify_card_session_mac(&parse_hex(&card_mac)?)? {
                    println!("Card certificate verified.");
                } else {
                    println!("Card certificate mismatch!");
                }
            }
        }
        Commands::Pin { keys, pin, new_pin } => {
            let mut session = keys.open(SessionConfig::new())?;
            let block = match new_pin {
                Some(new_pin) => session.cipher_pin_for_modification(
                    pin.as_bytes(),
                    new_pin.as_bytes(),
                    keys.kif,
                    keys.kvc,
                )?,
                None => session.cipher_pin_for_presentation(pin.as_bytes(), keys.kif, keys.kvc)?,
            };
            println!("Ciphered PIN block: {}", hex::encode_upper(block));
        }
    }

    Ok(())
}
