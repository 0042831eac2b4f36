use engine::{Engine, EngineError, LoadOptions, Sampling, TokenEvent};
use model::{MlpKind, ModelConfig, ModelError, NormKind, TokenKind, Weights};
use std::path::PathBuf;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn tiny_config(vocab: u32, max_seq: u32) -> ModelConfig {
    ModelConfig {
        version: 2,
        vocab,
        d_model: 2,
        n_heads: 1,
        n_layers: 1,
        d_ff: 2,
        max_seq,
        token_kind: TokenKind::Bytes,
        mlp_kind: MlpKind::Relu,
        norm_kind: NormKind::RmsNorm,
        rope_theta_base: 10_000.0,
        rope_freq_scale: 1.0,
    }
}

/// All-zero weights: every logit is zero, so the argmax path emits token 0
/// (the NUL byte) forever.
fn zero_model(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("zero.cllf");
    Weights::zeroed(tiny_config(8, 64)).save(&path).unwrap();
    path
}

/// Embedding row 0 is [1, 0] and the output head wires dimension 0 to
/// token 2 (EOS). One step after consuming token 0, generation stops.
fn eos_model(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("eos.cllf");
    let mut w = Weights::zeroed(tiny_config(4, 64));
    w.tok_emb[0] = 1.0;
    w.lm_head[2] = 1.0;
    w.save(&path).unwrap();
    path
}

fn greedy(max_tokens: usize) -> Sampling {
    Sampling {
        temperature: 0.0,
        top_k: 1,
        top_p: 1.0,
        max_tokens,
        ..Sampling::default()
    }
}

fn run_chat(
    engine: &mut Engine,
    prompt: &str,
    sampling: &Sampling,
) -> (Vec<TokenEvent>, std::result::Result<(), EngineError>) {
    let mut events = Vec::new();
    let res = engine.chat(prompt, sampling, &mut |ev| events.push(ev.clone()), &|| false);
    (events, res)
}

#[test]
fn greedy_decode_is_deterministic_golden() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(zero_model(&dir)))?;

    let (events, res) = run_chat(&mut engine, "abc", &greedy(4));
    res?;

    // Zero logits pick token 0 every step: four NUL pieces then the final.
    let texts: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["\0", "\0", "\0", "\0", ""]);
    assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
    assert!(events.last().unwrap().is_final);

    // Same prompt, same model: identical emission sequence.
    let (again, res) = run_chat(&mut engine, "abc", &greedy(4));
    res?;
    let texts_again: Vec<&str> = again.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, texts_again);
    Ok(())
}

#[test]
fn eos_terminates_generation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(eos_model(&dir)))?;

    let (events, res) = run_chat(&mut engine, "a", &greedy(16));
    res?;

    // First sample comes from zero prefill logits (token 0), the next step
    // steers to EOS, so exactly one piece precedes the terminal event.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].text, "\0");
    assert!(!events[0].is_final);
    assert!(events[1].is_final);
    assert!(events[1].text.is_empty());
    Ok(())
}

#[test]
fn context_exhaustion_surfaces() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("short.cllf");
    Weights::zeroed(tiny_config(8, 4)).save(&path)?;

    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(path))?;

    // "ab" tokenizes to 3 ids; one decode step fits, the second does not.
    let (events, res) = run_chat(&mut engine, "ab", &greedy(10));
    assert!(matches!(
        res,
        Err(EngineError::Model(ModelError::ContextExhausted))
    ));
    assert_eq!(events.iter().filter(|e| !e.is_final).count(), 2);
    Ok(())
}

#[test]
fn cancellation_emits_terminal_and_surfaces() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(zero_model(&dir)))?;

    let mut events = Vec::new();
    let res = engine.chat(
        "abc",
        &greedy(100),
        &mut |ev: &TokenEvent| events.push(ev.clone()),
        &|| true,
    );
    assert!(matches!(res, Err(EngineError::Cancelled)));
    assert_eq!(events.len(), 1);
    assert!(events[0].is_final);
    Ok(())
}

#[test]
fn stream_false_suppresses_events() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(zero_model(&dir)))?;

    let sampling = Sampling { stream: false, ..greedy(3) };
    let (events, res) = run_chat(&mut engine, "abc", &sampling);
    res?;
    assert!(events.is_empty());
    Ok(())
}

#[test]
fn token_rate_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(zero_model(&dir)))?;

    let (events, res) = run_chat(&mut engine, "x", &greedy(8));
    res?;
    assert!(events.iter().all(|e| e.tokens_per_sec >= 0.0));
    Ok(())
}

#[test]
fn embed_mean_pools_embedding_rows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(eos_model(&dir)))?;

    // "\0" tokenizes to [BOS, 0]; row 1 is zero, row 0 is [1, 0].
    let e = engine.embed("\0")?;
    assert_eq!(e, vec![0.5, 0.0]);
    Ok(())
}

#[test]
fn reload_and_session_reset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    engine.load(&LoadOptions::new(zero_model(&dir)))?;

    let (first, res) = run_chat(&mut engine, "abc", &greedy(3));
    res?;
    engine.reset_session()?;
    let (second, res) = run_chat(&mut engine, "abc", &greedy(3));
    res?;
    assert_eq!(first.len(), second.len());

    engine.unload();
    assert!(matches!(
        run_chat(&mut engine, "abc", &greedy(3)).1,
        Err(EngineError::NotLoaded)
    ));
    Ok(())
}

#[test]
fn info_and_capabilities_describe_the_backend() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Engine::from_backend("local")?;
    let mut opt = LoadOptions::new(zero_model(&dir));
    opt.ctx_len = 128;
    engine.load(&opt)?;

    let info = engine.info();
    assert_eq!(info.backend, "local");
    assert_eq!(info.ctx_len, 128);
    assert_eq!(info.vocab_size, 260);
    assert!(engine.capabilities().contains("128"));
    Ok(())
}

#[test]
fn chat_template_changes_the_prompt() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("short.cllf");
    // max_seq 8: the raw prompt "x" (2 ids) fits, the chat template
    // ("User: x\nAssistant:" = 19 ids) does not.
    Weights::zeroed(tiny_config(8, 8)).save(&path)?;

    let mut engine = Engine::from_backend("local")?;
    let mut opt = LoadOptions::new(path);
    opt.template_name = Some("chat".into());
    engine.load(&opt)?;

    let (_, res) = run_chat(&mut engine, "x", &greedy(1));
    assert!(matches!(
        res,
        Err(EngineError::Model(ModelError::ContextExhausted))
    ));
    Ok(())
}
