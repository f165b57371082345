use std::{sync::Arc, thread};

use hsm_core::{
    AttributeSet, AttributeTemplate, AttributeValue, HsmError, MechanismSpec, OperationKind,
    SessionHandle, SoftToken,
    pkcs11::{attribute, class, key_type, mechanism},
};
use sha2::{Digest, Sha256};

fn user_session(token: &SoftToken) -> SessionHandle {
    let session = token.open_session(false);
    token.login(session).expect("login");
    session
}

fn token_key(token: &SoftToken, session: SessionHandle, label: &str) -> u64 {
    let mut attrs = AttributeSet::new();
    attrs.insert(attribute::VALUE_LEN, AttributeValue::Uint(32));
    attrs.insert(attribute::TOKEN, AttributeValue::Bool(true));
    attrs.insert(attribute::SIGN, AttributeValue::Bool(true));
    attrs.insert(attribute::LABEL, AttributeValue::Bytes(label.as_bytes().to_vec()));
    token
        .generate_key(
            session,
            &MechanismSpec::new(mechanism::GENERIC_SECRET_KEY_GEN, Vec::new()),
            attrs,
        )
        .expect("generate")
}

#[test]
fn multipart_digest_matches_reference() {
    let token = SoftToken::default();
    let session = token.open_session(true);
    let sha = MechanismSpec::new(mechanism::SHA256, Vec::new());

    token
        .operation_init(session, OperationKind::Digest, &sha, None)
        .unwrap();
    for chunk in [b"hello ".as_slice(), b"soft ", b"token"] {
        assert!(
            token
                .operation_update(session, OperationKind::Digest, chunk, true)
                .unwrap()
                .is_empty()
        );
    }
    let digest = token
        .operation_final(session, OperationKind::Digest, true)
        .unwrap();
    assert_eq!(digest, Sha256::digest(b"hello soft token").to_vec());
    assert_eq!(
        token.operation_final(session, OperationKind::Digest, true),
        Err(HsmError::OperationNotInitialized)
    );
}

#[test]
fn token_objects_outlive_their_session() {
    let token = SoftToken::default();
    let creator = user_session(&token);
    let key = token_key(&token, creator, "shared");
    token.close_session(creator).unwrap();

    let reader = user_session(&token);
    let mut template = AttributeTemplate::new();
    template.push(attribute::CLASS, AttributeValue::Uint(class::SECRET_KEY));
    template.push(attribute::KEY_TYPE, AttributeValue::Uint(key_type::GENERIC_SECRET));
    token.find_objects_init(reader, template).unwrap();
    assert_eq!(token.find_objects(reader, 1).unwrap(), vec![key]);
    assert!(token.find_objects(reader, 1).unwrap().is_empty());
    token.find_objects_final(reader).unwrap();

    token
        .operation_init(
            reader,
            OperationKind::Sign,
            &MechanismSpec::new(mechanism::SHA256_HMAC, Vec::new()),
            Some(key),
        )
        .unwrap();
    let mac = token
        .operation_single(reader, OperationKind::Sign, b"payload", true)
        .unwrap();
    assert_eq!(mac.len(), 32);
}

#[test]
fn sessions_work_independently_across_threads() {
    let token = Arc::new(SoftToken::default());
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let token = Arc::clone(&token);
            thread::spawn(move || {
                let session = user_session(&token);
                let key = token_key(&token, session, &format!("worker-{i}"));
                token
                    .operation_init(
                        session,
                        OperationKind::Sign,
                        &MechanismSpec::new(mechanism::SHA256_HMAC, Vec::new()),
                        Some(key),
                    )
                    .unwrap();
                token
                    .operation_update(session, OperationKind::Sign, &[i as u8; 64], true)
                    .unwrap();
                token
                    .operation_final(session, OperationKind::Sign, true)
                    .unwrap()
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().expect("worker").len(), 32);
    }

    let session = user_session(&token);
    token
        .find_objects_init(session, AttributeTemplate::new())
        .unwrap();
    assert_eq!(token.find_objects(session, 16).unwrap().len(), 4);
}
