//! Session settings and informational commands

use async_trait::async_trait;

use crate::context::{ControlSecurity, FileType};
use crate::dispatch::{CommandContext, CommandHandler, CommandResult};
use crate::fs::{display_path, resolve};
use crate::protocol::reply;
use crate::response::Response;

use super::listing::{self, MlstFacts, KNOWN_FACTS};

pub struct Noop;

#[async_trait]
impl CommandHandler for Noop {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        cx.reply(reply::OK, "Command okay.")
    }
}

pub struct Syst;

#[async_trait]
impl CommandHandler for Syst {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, _cx: &CommandContext) -> CommandResult {
        Ok(Some(Response::new(reply::SYSTEM_TYPE, "UNIX Type: L8")))
    }
}

pub struct Feat;

#[async_trait]
impl CommandHandler for Feat {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let mut lines = vec![ctx.t("Extensions supported:")];
        if ctx.services.tls.is_some() {
            lines.extend(["AUTH TLS".to_string(), "PBSZ".to_string(), "PROT".to_string(), "CCC".to_string()]);
        }
        let languages: Vec<String> = ctx
            .services
            .catalogs
            .supported_languages()
            .into_iter()
            .map(|l| if l == ctx.services.catalogs.default_language() { format!("{l}*") } else { l })
            .collect();
        lines.push(format!("LANG {}", languages.join(";")));
        lines.push(format!("MLST {}", listing::feat_facts(&listing::active_facts(ctx))));
        lines.extend(["EPRT", "EPSV", "PASV", "REST STREAM", "TVFS", "UTF8"].map(String::from));
        lines.push(ctx.t("End"));
        Ok(Some(Response::multiline(reply::SYSTEM_STATUS, lines)))
    }
}

pub struct Opts;

#[async_trait]
impl CommandHandler for Opts {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let arg = cx.argument().trim();
        let (option, value) = arg.split_once(' ').unwrap_or((arg, ""));
        match option.to_ascii_uppercase().as_str() {
            "UTF8" | "UTF-8" => {
                let value = value.trim().to_ascii_uppercase();
                if value == "NLST" {
                    ctx.session.lock().nlst_encoding = Some(encoding_rs::UTF_8);
                    return cx.reply(reply::OK, "NLST encoding set to UTF-8.");
                }
                let encoding = match value.as_str() {
                    "" | "ON" => encoding_rs::UTF_8,
                    "OFF" => ctx.services.default_encoding,
                    _ => return cx.reply(reply::PARAMETER_ERROR, "Syntax error in parameters or arguments."),
                };
                ctx.session.lock().encoding = encoding;
                cx.reply(reply::OK, &format!("Control encoding set to {}.", encoding.name()))
            }
            "MLST" => {
                let facts: Vec<String> = value
                    .split(';')
                    .map(|f| f.trim().to_ascii_lowercase())
                    .filter(|f| KNOWN_FACTS.contains(&f.as_str()))
                    .collect();
                let text = facts.iter().map(|f| format!("{f};")).collect::<String>();
                ctx.extensions.insert(MlstFacts(facts));
                Ok(Some(Response::new(reply::OK, format!("MLST OPTS {text}"))))
            }
            _ => cx.reply(reply::PARAMETER_ERROR, "Option not understood."),
        }
    }
}

pub struct Type;

#[async_trait]
impl CommandHandler for Type {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let arg = cx.argument().trim().to_ascii_uppercase();
        let file_type = match arg.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["A"] | ["A", "N"] => FileType::Ascii,
            ["I"] | ["L", "8"] => FileType::Image,
            _ => return cx.reply(reply::PARAMETER_NOT_IMPLEMENTED, "Type not implemented."),
        };
        cx.connection.session.lock().file_type = file_type;
        let name = if file_type == FileType::Ascii { "A" } else { "I" };
        cx.reply(reply::OK, &format!("Type set to {name}."))
    }
}

pub struct Mode;

#[async_trait]
impl CommandHandler for Mode {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        match cx.argument().trim().to_ascii_uppercase().as_str() {
            "S" => cx.reply(reply::OK, "Mode set to S."),
            _ => cx.reply(reply::PARAMETER_NOT_IMPLEMENTED, "Only stream mode is supported."),
        }
    }
}

pub struct Stru;

#[async_trait]
impl CommandHandler for Stru {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        match cx.argument().trim().to_ascii_uppercase().as_str() {
            "F" => cx.reply(reply::OK, "Structure set to F."),
            _ => cx.reply(reply::PARAMETER_NOT_IMPLEMENTED, "Only file structure is supported."),
        }
    }
}

pub struct Lang;

#[async_trait]
impl CommandHandler for Lang {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let catalogs = &cx.connection.services.catalogs;
        let tag = match cx.argument().trim() {
            "" => catalogs.default_language().to_string(),
            tag => tag.to_string(),
        };
        let Some(catalog) = catalogs.load(&tag) else {
            return cx.reply(reply::PARAMETER_NOT_IMPLEMENTED, "Language not supported.");
        };
        let language = catalog.language().to_string();
        cx.connection.session.lock().catalog = catalog;
        cx.reply(reply::OK, &format!("Language set to {language}."))
    }
}

pub struct Stat;

#[async_trait]
impl CommandHandler for Stat {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        if !cx.argument().trim().is_empty() {
            let (fs, path) = {
                let session = ctx.session.lock();
                (session.file_system.clone(), resolve(&session.path, cx.argument().trim())?)
            };
            let mut lines = vec![format!("Status of {}:", display_path(&path))];
            lines.extend(fs.list(&path).await?.iter().map(listing::unix_line));
            lines.push(ctx.t("End of status"));
            return Ok(Some(Response::multiline(reply::FILE_STATUS, lines)));
        }

        let mechanism = ctx.login.lock().mechanism().map(str::to_string);
        let mut lines = {
            let session = ctx.session.lock();
            let user = session.user.as_ref().map(|u| u.name.clone()).unwrap_or_else(|| "-".into());
            let file_type = if session.file_type == FileType::Ascii { "ASCII" } else { "BINARY" };
            let security = match session.control_security {
                ControlSecurity::Plain => "none",
                ControlSecurity::Explicit => "TLS (explicit)",
                ControlSecurity::Implicit => "TLS (implicit)",
            };
            vec![
                format!("{} status:", env!("CARGO_PKG_NAME")),
                format!("Connected to {}", ctx.remote_addr().ip()),
                format!("Logged in as {}", user),
                format!("TYPE: {}, encoding {}", file_type, session.encoding.name()),
                format!("Control protection: {}, data protection: {:?}", security, session.data_protection),
                "End of status".to_string(),
            ]
        };
        if let Some(mechanism) = mechanism {
            lines.insert(lines.len() - 1, format!("Security mechanism: AUTH {mechanism}"));
        }
        Ok(Some(Response::multiline(reply::SYSTEM_STATUS, lines)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::listing::active_facts;
    use crate::command::Command;
    use crate::context::test_support::{self, TestConnection};
    use crate::context::FileType;
    use crate::dispatch::CommandContext;
    use crate::localization::{Catalog, CatalogLoader};

    struct EnglishAndGerman {
        en: Arc<Catalog>,
        de: Arc<Catalog>,
    }

    impl CatalogLoader for EnglishAndGerman {
        fn default_language(&self) -> &str {
            "en"
        }

        fn supported_languages(&self) -> Vec<String> {
            vec!["en".to_string(), "de".to_string()]
        }

        fn load(&self, language: &str) -> Option<Arc<Catalog>> {
            match language {
                "en" => Some(self.en.clone()),
                "de" => Some(self.de.clone()),
                _ => None,
            }
        }
    }

    async fn run(t: &TestConnection, line: &str) -> u16 {
        let cx = CommandContext::new(Command::parse(line), t.ctx.clone());
        let handler = t.ctx.services.handlers.get(cx.command.verb()).unwrap();
        match handler.process(&cx).await {
            Ok(Some(r)) => r.code,
            Ok(None) => 0,
            Err(e) => e.code(),
        }
    }

    #[tokio::test]
    async fn rein_restores_session_defaults() {
        let t = test_support::connection(|s| {
            let mut german = HashMap::new();
            german.insert("Command okay.".to_string(), "Befehl okay.".to_string());
            s.catalogs = Arc::new(EnglishAndGerman {
                en: Arc::new(Catalog::new("en", HashMap::new())),
                de: Arc::new(Catalog::new("de", german)),
            });
            s.default_encoding = encoding_rs::WINDOWS_1252;
        });

        assert_eq!(run(&t, "OPTS UTF8 ON").await, 200);
        assert_eq!(run(&t, "OPTS UTF8 NLST").await, 200);
        assert_eq!(run(&t, "TYPE I").await, 200);
        assert_eq!(run(&t, "LANG de").await, 200);
        assert_eq!(run(&t, "OPTS MLST size;").await, 200);
        {
            let session = t.ctx.session.lock();
            assert_eq!(session.encoding, encoding_rs::UTF_8);
            assert_eq!(session.nlst_encoding, Some(encoding_rs::UTF_8));
            assert!(session.file_type == FileType::Image);
        }
        assert_eq!(t.ctx.t("Command okay."), "Befehl okay.");
        assert_eq!(active_facts(&t.ctx), vec!["size".to_string()]);

        assert_eq!(run(&t, "REIN").await, 220);
        {
            let session = t.ctx.session.lock();
            assert_eq!(session.encoding, encoding_rs::WINDOWS_1252);
            assert_eq!(session.nlst_encoding, None);
            assert!(session.file_type == FileType::Ascii);
            assert_eq!(session.catalog.language(), "en");
        }
        assert_eq!(t.ctx.t("Command okay."), "Command okay.");
        assert_eq!(active_facts(&t.ctx), vec!["type", "size", "modify"]);
    }
}
