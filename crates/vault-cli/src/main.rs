//! Command-line front end: container management plus streamed chat.

#![deny(unsafe_code)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::{Engine, LoadOptions, LocalEngine, Sampling};
use std::io::Write;
use std::path::PathBuf;
use vault::Container;

#[derive(Parser, Debug)]
#[command(name = "ovault", about = "Encrypted container and local chat engine")]
struct Cli {
    /// Password for container commands; prompts interactively when omitted.
    #[arg(short, long, global = true)]
    password: Option<String>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new empty container
    Create {
        container: PathBuf,
    },
    /// List virtual paths in a container
    Ls {
        container: PathBuf,
    },
    /// Store a local file under a virtual path
    Put {
        container: PathBuf,
        vpath: String,
        file: PathBuf,
    },
    /// Extract a virtual file to disk
    Get {
        container: PathBuf,
        vpath: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print a virtual file to stdout
    Cat {
        container: PathBuf,
        vpath: String,
    },
    /// Remove a virtual file
    Rm {
        container: PathBuf,
        vpath: String,
    },
    /// Stream a completion from a weight file
    Chat {
        /// Weight file path
        #[arg(short, long)]
        model: PathBuf,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 1.0)]
        temperature: f32,
        #[arg(long, default_value_t = 40)]
        top_k: usize,
        #[arg(long, default_value_t = 0.95)]
        top_p: f32,
        #[arg(long, default_value_t = 1.1)]
        repetition_penalty: f32,
        #[arg(long, default_value_t = 0.0)]
        min_prob: f32,
        #[arg(long, default_value_t = 256)]
        max_tokens: usize,
        #[arg(long, default_value_t = 4096)]
        ctx_len: usize,
        /// Prompt template name (e.g. "chat")
        #[arg(long)]
        template: Option<String>,
        /// Fixed sampling seed for reproducible output (local backend)
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value = "local")]
        backend: String,
    },
    /// List engine backends and their capabilities
    Backends,
}

fn main() -> anyhow::Result<()> {
    telemetry::init_json_logging();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Create { container } => {
            let pw = password(cli.password)?;
            Container::create(&container, &pw)?.close()?;
            println!("created {}", container.display());
        }
        Command::Ls { container } => {
            let pw = password(cli.password)?;
            for vpath in Container::open(&container, &pw)?.list_files() {
                println!("{vpath}");
            }
        }
        Command::Put { container, vpath, file } => {
            let pw = password(cli.password)?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut c = Container::open(&container, &pw)?;
            c.write_file(&vpath, &bytes)?;
            c.close()?;
            println!("stored {} ({} bytes)", vpath, bytes.len());
        }
        Command::Get { container, vpath, out } => {
            let pw = password(cli.password)?;
            let mut c = Container::open(&container, &pw)?;
            let bytes = c.read_file(&vpath)?;
            let target = out.unwrap_or_else(|| PathBuf::from(&vpath));
            std::fs::write(&target, &bytes)
                .with_context(|| format!("writing {}", target.display()))?;
            println!("wrote {} ({} bytes)", target.display(), bytes.len());
        }
        Command::Cat { container, vpath } => {
            let pw = password(cli.password)?;
            let mut c = Container::open(&container, &pw)?;
            std::io::stdout().write_all(&c.read_file(&vpath)?)?;
        }
        Command::Rm { container, vpath } => {
            let pw = password(cli.password)?;
            let mut c = Container::open(&container, &pw)?;
            c.delete_file(&vpath)?;
            c.close()?;
            println!("removed {vpath}");
        }
        Command::Chat {
            model,
            prompt,
            temperature,
            top_k,
            top_p,
            repetition_penalty,
            min_prob,
            max_tokens,
            ctx_len,
            template,
            seed,
            backend,
        } => {
            let sampling = Sampling {
                temperature,
                top_k,
                top_p,
                repetition_penalty,
                min_prob,
                max_tokens,
                ..Sampling::default()
            };
            let mut opt = LoadOptions::new(model);
            opt.ctx_len = ctx_len;
            opt.template_name = template;
            cmd_chat(&backend, seed, &opt, &prompt, &sampling)?;
        }
        Command::Backends => {
            for name in Engine::available_backends() {
                let eng = Engine::from_backend(name)?;
                println!("{name}: {}", eng.capabilities());
            }
        }
    }
    Ok(())
}

fn password(cli_arg: Option<String>) -> anyhow::Result<String> {
    match cli_arg {
        Some(pw) => Ok(pw),
        None => Ok(rpassword::prompt_password("Password: ")?),
    }
}

fn cmd_chat(
    backend: &str,
    seed: Option<u64>,
    opt: &LoadOptions,
    prompt: &str,
    sampling: &Sampling,
) -> anyhow::Result<()> {
    let mut eng = match seed {
        Some(s) => Engine::Local(LocalEngine::with_seed(s)),
        None => Engine::from_backend(backend)?,
    };
    eng.load(opt)?;

    let mut tps = 0.0;
    eng.chat(
        prompt,
        sampling,
        &mut |ev| {
            if ev.is_final {
                tps = ev.tokens_per_sec;
            } else {
                print!("{}", ev.text);
                let _ = std::io::stdout().flush();
            }
        },
        &|| false,
    )?;
    println!();
    eprintln!("[{tps:.1} tok/s]");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{MlpKind, ModelConfig, NormKind, TokenKind, Weights};

    #[test]
    fn container_workflow_via_library_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.ocv");
        Container::create(&path, "pw").unwrap().close().unwrap();

        let mut c = Container::open(&path, "pw").unwrap();
        c.write_file("notes.txt", b"from the cli").unwrap();
        assert_eq!(c.list_files(), vec!["notes.txt".to_string()]);
        assert_eq!(c.read_file("notes.txt").unwrap(), b"from the cli");
    }

    #[test]
    fn chat_command_runs_a_tiny_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.cllf");
        Weights::zeroed(ModelConfig {
            version: 2,
            vocab: 8,
            d_model: 2,
            n_heads: 1,
            n_layers: 1,
            d_ff: 2,
            max_seq: 32,
            token_kind: TokenKind::Bytes,
            mlp_kind: MlpKind::Relu,
            norm_kind: NormKind::RmsNorm,
            rope_theta_base: 10_000.0,
            rope_freq_scale: 1.0,
        })
        .save(&path)
        .unwrap();

        let sampling = Sampling { temperature: 0.0, max_tokens: 2, ..Sampling::default() };
        cmd_chat("local", Some(7), &LoadOptions::new(path), "hi", &sampling).unwrap();
    }

    #[test]
    fn explicit_password_skips_prompt() {
        assert_eq!(password(Some("pw".into())).unwrap(), "pw");
    }
}
