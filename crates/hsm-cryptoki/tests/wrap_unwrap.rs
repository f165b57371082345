use hsm_cryptoki::{
    AttributeType as A, Mechanism, MechanismType, ObjectHandle, OperationKind, OperationState,
    Outcome, Session, Template,
    cryptoki_sys::{CK_ULONG, CKK_AES, CKO_SECRET_KEY, CKR_KEY_UNEXTRACTABLE},
    soft::SoftModule,
};
use tracing_subscriber::EnvFilter;

const ZERO_IV: [u8; 16] = [0u8; 16];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn logged_in(module: &SoftModule) -> hsm_cryptoki::SessionHandle {
    init_tracing();
    let session = module.open_session(false);
    module.login(session).expect("login");
    session
}

fn cbc_pad() -> Mechanism {
    Mechanism::with_iv(MechanismType::AES_CBC_PAD, ZERO_IV).expect("bind")
}

fn aes_key(session: &Session<'_>, flags: &[(A, bool)]) -> ObjectHandle {
    let template = flags
        .iter()
        .fold(Template::new().with(A::VALUE_LEN, 16 as CK_ULONG), |t, (ty, on)| {
            t.with(*ty, *on)
        });
    session
        .generate_key(&Mechanism::new(MechanismType::AES_KEY_GEN).unwrap(), &template)
        .expect("generate")
}

#[test]
fn wrapped_key_decrypts_original_ciphertext() {
    let module = SoftModule::default();
    let handle = logged_in(&module);
    let mut session = Session::new(&module, handle);

    let data_key = aes_key(
        &session,
        &[(A::ENCRYPT, true), (A::DECRYPT, true), (A::EXTRACTABLE, true)],
    );
    let plaintext: Vec<u8> = (0u8..37).collect();
    let ciphertext = session.encrypt(&cbc_pad(), data_key, &plaintext).unwrap();
    assert_eq!(ciphertext.len(), 48);

    let kek = aes_key(&session, &[(A::WRAP, true), (A::UNWRAP, true)]);
    let wrapped = session.wrap_key(&cbc_pad(), kek, data_key).unwrap();
    assert_eq!(wrapped.len(), 32);

    let unwrap_template = Template::new()
        .with(A::CLASS, CKO_SECRET_KEY)
        .with(A::KEY_TYPE, CKK_AES)
        .with(A::DECRYPT, true)
        .with(A::SENSITIVE, true);
    let restored = session
        .unwrap_key(&cbc_pad(), kek, &wrapped, &unwrap_template)
        .unwrap();
    assert_ne!(restored, data_key);

    let recovered = session.decrypt(&cbc_pad(), restored, &ciphertext).unwrap();
    assert_eq!(recovered, plaintext);

    let err = session.encrypt(&cbc_pad(), restored, &plaintext).unwrap_err();
    assert!(err.is_permission_denied());
    assert_eq!(session.operation_state(OperationKind::Encrypt), OperationState::Idle);

    let attributes = session
        .get_attributes(restored, &[A::VALUE, A::VALUE_LEN, A::DECRYPT])
        .unwrap();
    assert!(attributes.get(A::VALUE).is_absent());
    assert_eq!(attributes.get_ulong(A::VALUE_LEN), Some(16));
    assert_eq!(attributes.get_bool(A::DECRYPT), Some(true));
}

#[test]
fn unextractable_key_is_refused_by_the_token() {
    let module = SoftModule::default();
    let handle = logged_in(&module);
    let session = Session::new(&module, handle);

    let pinned = aes_key(&session, &[(A::ENCRYPT, true), (A::EXTRACTABLE, false)]);
    let kek = aes_key(&session, &[(A::WRAP, true)]);

    let err = session.wrap_key(&cbc_pad(), kek, pinned).unwrap_err();
    assert_eq!(
        err.outcome(),
        Some(Outcome::PermissionDenied(CKR_KEY_UNEXTRACTABLE.into()))
    );
}

#[test]
fn wrapping_needs_a_wrap_capable_mechanism() {
    let module = SoftModule::default();
    let handle = logged_in(&module);
    let session = Session::new(&module, handle);
    let key = aes_key(&session, &[(A::EXTRACTABLE, true)]);
    let kek = aes_key(&session, &[(A::WRAP, true)]);

    let digest = Mechanism::new(MechanismType::SHA256).unwrap();
    let err = session.wrap_key(&digest, kek, key).unwrap_err();
    assert!(matches!(err, hsm_cryptoki::Error::Validation(_)));
}
