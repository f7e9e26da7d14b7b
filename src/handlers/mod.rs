//! FTP command handlers, looked up by verb

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::CommandHandler;

mod dirs;
mod files;
mod listing;
mod login;
mod session;
mod transfer;

pub use files::RenameFrom;
pub use listing::MlstFacts;
pub use transfer::RestartOffset;

#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, verb: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(verb.to_ascii_uppercase(), handler);
    }

    pub fn get(&self, verb: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(verb).cloned()
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.handlers.contains_key(verb)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut r = Self::empty();

        r.register("USER", Arc::new(login::User));
        r.register("PASS", Arc::new(login::Pass));
        r.register("QUIT", Arc::new(login::Quit));
        r.register("REIN", Arc::new(login::Rein));
        r.register("AUTH", Arc::new(login::Auth));
        r.register("PBSZ", Arc::new(login::Pbsz));
        r.register("PROT", Arc::new(login::Prot));
        r.register("CCC", Arc::new(login::Ccc));

        r.register("NOOP", Arc::new(session::Noop));
        r.register("SYST", Arc::new(session::Syst));
        r.register("FEAT", Arc::new(session::Feat));
        r.register("OPTS", Arc::new(session::Opts));
        r.register("TYPE", Arc::new(session::Type));
        r.register("MODE", Arc::new(session::Mode));
        r.register("STRU", Arc::new(session::Stru));
        r.register("LANG", Arc::new(session::Lang));
        r.register("STAT", Arc::new(session::Stat));

        let pwd = Arc::new(dirs::Pwd);
        r.register("PWD", pwd.clone());
        r.register("XPWD", pwd);
        let cwd = Arc::new(dirs::Cwd);
        r.register("CWD", cwd.clone());
        r.register("XCWD", cwd);
        let cdup = Arc::new(dirs::Cdup);
        r.register("CDUP", cdup.clone());
        r.register("XCUP", cdup);
        r.register("RNFR", Arc::new(files::Rnfr));
        r.register("RNTO", Arc::new(files::Rnto));

        r.register("PASV", Arc::new(transfer::Pasv));
        r.register("EPSV", Arc::new(transfer::Epsv));
        r.register("PORT", Arc::new(transfer::Port));
        r.register("EPRT", Arc::new(transfer::Eprt));
        r.register("LIST", Arc::new(listing::List));
        r.register("NLST", Arc::new(listing::Nlst));
        r.register("MLSD", Arc::new(listing::Mlsd));
        r.register("MLST", Arc::new(listing::Mlst));
        r.register("RETR", Arc::new(transfer::Retr));
        r.register("STOR", Arc::new(transfer::Stor));
        r.register("APPE", Arc::new(transfer::Appe));
        r.register("REST", Arc::new(transfer::Rest));
        r.register("ABOR", Arc::new(transfer::Abor));
        r
    }
}
