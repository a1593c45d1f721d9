use anyhow::{anyhow, bail, Context as _, Result};
use chatseal_core::fanout::FanoutEncryptor;
use chatseal_core::keystore::{GeneratedKeyPair, KeyRecord, KeyStore};
use chatseal_core::ledger::{unix_now, IntegrityLedger, LedgerEntry};
use chatseal_core::message::{AuditSubject, MediaType, MessageContent, MessageRecord};
use chatseal_core::paths;
use chatseal_core::settings::ChatSealSettings;
use chatseal_core::{EncryptedEnvelope, IntegrityAuditor};
use chatseal_crypto::{KeyType, SecretKey};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "chatseal: conversation encryption and message integrity ledger", long_about = None)]
struct Cli {
    /// Data directory (defaults to $CHATSEAL_DATA_DIR, then the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage owner key pairs
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    /// Encrypt a message for every participant of a conversation
    Encrypt {
        #[arg(long)]
        sender: String,
        /// Comma-separated participant ids
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,
        #[arg(long)]
        text: String,
        /// Generated when omitted
        #[arg(long)]
        message_id: Option<String>,
        /// Sender's exported signing secret
        #[arg(long)]
        signing_secret: Option<String>,
        /// Also record the message in the ledger under this conversation
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Decrypt an envelope read from a JSON file
    Open {
        #[arg(long)]
        envelope: PathBuf,
        /// Recipient's exported encryption secret
        #[arg(long)]
        secret: String,
    },
    /// Inspect or append to the integrity ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Audit a conversation's messages against the ledger
    Audit {
        conversation: String,
        /// JSON array of {"message_id", "plaintext" | "ciphertext_ref"}
        #[arg(long)]
        messages: PathBuf,
    },
    /// Validate the chain and audit a random sample of messages
    IntegrityCheck {
        #[arg(long)]
        messages: PathBuf,
        /// Defaults to the configured sample size
        #[arg(long)]
        sample_size: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum IdentityCommand {
    /// Issue a signing and an encryption key pair
    Create { owner: String },
    /// Replace one of an owner's active keys
    Rotate {
        owner: String,
        #[arg(long, value_parser = parse_key_type)]
        key_type: KeyType,
    },
    /// Issue whatever keys the given owners are missing
    Provision {
        #[arg(required = true)]
        owners: Vec<String>,
    },
    /// List an owner's keys, oldest first
    Show { owner: String },
}

#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// Record one message as a new block
    Record {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        sender: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        encrypted: bool,
    },
    /// Print blocks with index in [start, end)
    Blocks {
        #[arg(long, default_value = "0")]
        start: u64,
        #[arg(long)]
        end: Option<u64>,
    },
    /// Print a conversation's blocks
    Conversation { conversation: String },
    /// Per-conversation block and message counts
    Stats,
    /// Verify the ledger log without modifying it
    Validate,
}

fn parse_key_type(s: &str) -> Result<KeyType, String> {
    s.parse::<KeyType>().map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct IssuedKey<'a> {
    #[serde(flatten)]
    record: &'a KeyRecord,
    /// Shown once; not kept by the registry.
    secret_key: String,
}

impl<'a> From<&'a GeneratedKeyPair> for IssuedKey<'a> {
    fn from(pair: &'a GeneratedKeyPair) -> Self {
        Self {
            record: &pair.record,
            secret_key: pair.secret.encode(),
        }
    }
}

struct Context {
    data_dir: PathBuf,
    settings: ChatSealSettings,
}

impl Context {
    fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => paths::data_dir()?,
        };
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let settings = ChatSealSettings::load(&data_dir)?;
        Ok(Self { data_dir, settings })
    }

    fn keystore(&self) -> Result<KeyStore> {
        Ok(KeyStore::open(self.settings.key_registry_path(&self.data_dir))?)
    }

    fn ledger(&self) -> Result<Arc<IntegrityLedger>> {
        let ledger = IntegrityLedger::open(
            self.settings.ledger_path(&self.data_dir),
            self.settings.ledger_config(),
        )?;
        Ok(Arc::new(ledger))
    }

    /// For query commands: never repairs or appends to the log.
    fn ledger_read_only(&self) -> Result<Arc<IntegrityLedger>> {
        let ledger = IntegrityLedger::open_read_only(
            self.settings.ledger_path(&self.data_dir),
            self.settings.ledger_config(),
        )?;
        Ok(Arc::new(ledger))
    }

    fn ledger_path(&self) -> PathBuf {
        self.settings.ledger_path(&self.data_dir)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_messages(path: &Path) -> Result<Vec<AuditSubject>> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context::load(cli.data_dir)?;
    match cli.command {
        Commands::Identity { command } => identity_command(&ctx, command),
        Commands::Encrypt {
            sender,
            participants,
            text,
            message_id,
            signing_secret,
            conversation,
        } => {
            let message_id = message_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            encrypt_command(&ctx, message_id, sender, participants, text, signing_secret, conversation).await
        }
        Commands::Open { envelope, secret } => open_command(&envelope, &secret),
        Commands::Ledger { command } => ledger_command(&ctx, command).await,
        Commands::Audit {
            conversation,
            messages,
        } => {
            let messages = read_messages(&messages)?;
            let auditor = IntegrityAuditor::new(ctx.ledger_read_only()?);
            print_json(&auditor.audit_conversation(&conversation, &messages))
        }
        Commands::IntegrityCheck {
            messages,
            sample_size,
        } => {
            let messages = read_messages(&messages)?;
            let sample_size = sample_size.unwrap_or(ctx.settings.audit.sample_size);
            let auditor = IntegrityAuditor::new(ctx.ledger_read_only()?);
            let check = auditor.integrity_check(&messages, sample_size);
            print_json(&check)?;
            if !check.chain_valid {
                bail!("ledger chain is invalid");
            }
            Ok(())
        }
    }
}

fn identity_command(ctx: &Context, command: IdentityCommand) -> Result<()> {
    let store = ctx.keystore()?;
    match command {
        IdentityCommand::Create { owner } => {
            let identity = store.generate_identity(&owner)?;
            print_json(&serde_json::json!({
                "owner_id": identity.owner_id,
                "signing": IssuedKey::from(&identity.signing),
                "encryption": IssuedKey::from(&identity.encryption),
            }))
        }
        IdentityCommand::Rotate { owner, key_type } => {
            let pair = store.rotate(&owner, key_type)?;
            print_json(&IssuedKey::from(&pair))
        }
        IdentityCommand::Provision { owners } => {
            let issued = store.provision_missing(&owners)?;
            info!(owners = owners.len(), issued = issued.len(), "provisioning complete");
            let out: Vec<IssuedKey> = issued.iter().map(IssuedKey::from).collect();
            print_json(&out)
        }
        IdentityCommand::Show { owner } => {
            let mut keys = store.keys_for(&owner, KeyType::Signing);
            keys.extend(store.keys_for(&owner, KeyType::Encryption));
            if keys.is_empty() {
                bail!("no keys for owner {owner}");
            }
            keys.sort_by_key(|k| k.created_at);
            print_json(&keys)
        }
    }
}

async fn encrypt_command(
    ctx: &Context,
    message_id: String,
    sender: String,
    participants: Vec<String>,
    text: String,
    signing_secret: Option<String>,
    conversation: Option<String>,
) -> Result<()> {
    let secret = signing_secret
        .as_deref()
        .map(SecretKey::decode)
        .transpose()
        .map_err(|e| anyhow!("invalid signing secret: {e}"))?;

    let fanout = FanoutEncryptor::new(Arc::new(ctx.keystore()?));
    let result = fanout.encrypt_for_conversation(&message_id, text.as_bytes(), &sender, &participants, secret.as_ref())?;

    let ledger_block_hash = match conversation {
        Some(conversation_id) => {
            let record = MessageRecord {
                message_id: message_id.clone(),
                conversation_id: conversation_id.clone(),
                sender_id: sender.clone(),
                content: MessageContent::Plaintext(text),
                is_encrypted: !result.envelopes.is_empty(),
                has_signature: result.signature.is_some(),
                media_type: MediaType::None,
            };
            let ledger = ctx.ledger()?;
            let entry = LedgerEntry::from_record(&record, unix_now());
            match ledger.append(conversation_id, vec![entry]).await {
                Ok(receipt) => Some(receipt.block.hash),
                Err(err) => {
                    warn!(message_id = %message_id, error = %err, "ledger record failed");
                    None
                }
            }
        }
        None => None,
    };

    print_json(&serde_json::json!({
        "message_id": message_id,
        "envelopes": result.envelopes,
        "signature": result.signature,
        "skipped": result.skipped,
        "ledger_block_hash": ledger_block_hash,
    }))
}

fn open_command(envelope_path: &Path, secret: &str) -> Result<()> {
    let bytes = fs::read(envelope_path).with_context(|| format!("reading {}", envelope_path.display()))?;
    let envelope: EncryptedEnvelope = serde_json::from_slice(&bytes)?;
    let secret = SecretKey::decode(secret).map_err(|e| anyhow!("invalid secret: {e}"))?;
    let plaintext = FanoutEncryptor::open_envelope(&envelope, &secret)?;
    println!("{}", String::from_utf8_lossy(&plaintext));
    Ok(())
}

async fn ledger_command(ctx: &Context, command: LedgerCommand) -> Result<()> {
    match command {
        LedgerCommand::Record {
            conversation,
            message_id,
            sender,
            text,
            encrypted,
        } => {
            let record = MessageRecord {
                message_id,
                conversation_id: conversation.clone(),
                sender_id: sender,
                content: MessageContent::Plaintext(text),
                is_encrypted: encrypted,
                has_signature: false,
                media_type: MediaType::None,
            };
            let ledger = ctx.ledger()?;
            let entry = LedgerEntry::from_record(&record, unix_now());
            let receipt = ledger.append(conversation, vec![entry]).await?;
            print_json(&serde_json::json!({
                "index": receipt.block.index,
                "hash": receipt.block.hash,
                "persisted": receipt.persisted,
            }))
        }
        LedgerCommand::Blocks { start, end } => {
            let ledger = ctx.ledger_read_only()?;
            let end = end.unwrap_or(ledger.len() as u64);
            print_json(&ledger.blocks(start..end))
        }
        LedgerCommand::Conversation { conversation } => {
            let ledger = ctx.ledger_read_only()?;
            print_json(&ledger.entries_for_conversation(&conversation))
        }
        LedgerCommand::Stats => {
            let ledger = ctx.ledger_read_only()?;
            print_json(&ledger.conversation_stats())
        }
        LedgerCommand::Validate => {
            let verification = IntegrityLedger::inspect_log(ctx.ledger_path())?;
            print_json(&verification)?;
            if !verification.valid {
                bail!(
                    "ledger chain is invalid: {}",
                    verification.error_message.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
    }
}
