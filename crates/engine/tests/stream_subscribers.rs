//! Subscriber registry behavior during a real generation. Kept in its own
//! test binary so the process-wide registry is not shared with other tests.

use engine::{
    add_stream_subscriber, clear_stream_subscribers, Engine, LoadOptions, Sampling,
    StreamSubscriber,
};
use model::{MlpKind, ModelConfig, NormKind, TokenKind, Weights};
use std::sync::{Arc, Mutex};

#[test]
fn subscribers_see_every_piece() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.cllf");
    Weights::zeroed(ModelConfig {
        version: 2,
        vocab: 8,
        d_model: 2,
        n_heads: 1,
        n_layers: 1,
        d_ff: 2,
        max_seq: 64,
        token_kind: TokenKind::Bytes,
        mlp_kind: MlpKind::Relu,
        norm_kind: NormKind::RmsNorm,
        rope_theta_base: 10_000.0,
        rope_freq_scale: 1.0,
    })
    .save(&path)
    .unwrap();

    let mut eng = Engine::from_backend("local").unwrap();
    eng.load(&LoadOptions::new(path)).unwrap();

    let seen = Arc::new(Mutex::new(String::new()));
    let sink = seen.clone();
    add_stream_subscriber(StreamSubscriber {
        on_token: Arc::new(move |piece| sink.lock().unwrap().push_str(piece)),
    });

    let sampling =
        Sampling { temperature: 0.0, top_k: 1, top_p: 1.0, max_tokens: 3, ..Sampling::default() };
    let mut pieces = String::new();
    eng.chat("abc", &sampling, &mut |ev| pieces.push_str(&ev.text), &|| false).unwrap();

    assert_eq!(seen.lock().unwrap().as_str(), pieces.as_str());
    assert_eq!(pieces, "\0\0\0");

    clear_stream_subscribers();
    eng.chat("abc", &sampling, &mut |_| {}, &|| false).unwrap();
    assert_eq!(seen.lock().unwrap().as_str(), "\0\0\0");
}
