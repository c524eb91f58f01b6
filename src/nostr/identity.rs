use anyhow::{anyhow, Result};
use nostr_sdk::prelude::*;
use rand::{thread_rng, Rng};

/// The local user: a signing keypair plus the nickname shown to the room.
#[derive(Debug, Clone)]
pub struct Identity {
    pub keys: Keys,
    pub pubkey: String,
    pub nickname: String,
    pub is_ephemeral: bool,
}

impl Identity {
    /// Fresh keypair for this session only.
    pub fn ephemeral() -> Self {
        let keys = Keys::generate();
        let pubkey = keys.public_key().to_hex();
        Self {
            keys,
            pubkey,
            nickname: generate_nickname(),
            is_ephemeral: true,
        }
    }

    pub fn from_nsec(nsec: &str) -> Result<Self> {
        let secret_key =
            SecretKey::from_bech32(nsec.trim()).map_err(|_| anyhow!("Invalid nsec format"))?;
        let keys = Keys::new(secret_key);
        let pubkey = keys.public_key().to_hex();
        let nickname = format!("user{}", &pubkey[..8]);
        Ok(Self {
            keys,
            pubkey,
            nickname,
            is_ephemeral: false,
        })
    }

    pub fn with_nickname(mut self, nickname: Option<&str>) -> Self {
        if let Some(nick) = nickname.map(str::trim).filter(|n| !n.is_empty()) {
            self.nickname = nick.to_string();
        }
        self
    }

    pub fn sign_event(&self, event_builder: EventBuilder) -> Result<Event> {
        Ok(event_builder.to_event(&self.keys)?)
    }
}

/// `{greeting}{animal}{number}`, e.g. "holapanda417".
fn generate_nickname() -> String {
    let greetings = [
        "hola", "ciao", "hallo", "salut", "annyeong", "konnichi", "ola", "hej", "ahoj", "merhaba",
        "namaste", "shalom", "jambo", "sawubona", "aloha", "szia",
    ];
    let animals = [
        "panda", "otter", "heron", "lynx", "gecko", "puffin", "koala", "bison", "wren", "ibis",
        "marten", "tapir", "okapi", "quokka", "yak", "fennec",
    ];

    let mut rng = thread_rng();
    let greeting = greetings[rng.gen_range(0..greetings.len())];
    let animal = animals[rng.gen_range(0..animals.len())];
    let number: u16 = rng.gen_range(100..1000);
    format!("{}{}{}", greeting, animal, number)
}
