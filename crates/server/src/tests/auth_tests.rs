use super::*;

#[test]
fn minted_token_round_trips_to_the_same_user() {
    let verifier = TokenVerifier::new("secret", 60);
    let token = verifier.mint(UserId(42)).expect("mint");
    assert_eq!(verifier.verify(&token), Ok(UserId(42)));
}

#[test]
fn expired_token_is_reported_as_expired() {
    let verifier = TokenVerifier::new("secret", -120);
    let token = verifier.mint(UserId(1)).expect("mint");
    assert_eq!(verifier.verify(&token), Err(AuthError::Expired));
}

#[test]
fn token_signed_with_another_secret_is_malformed() {
    let ours = TokenVerifier::new("secret", 60);
    let theirs = TokenVerifier::new("other", 60);
    let token = theirs.mint(UserId(1)).expect("mint");
    assert_eq!(ours.verify(&token), Err(AuthError::Malformed));
}

#[test]
fn garbage_token_is_malformed() {
    let verifier = TokenVerifier::new("secret", 60);
    assert_eq!(verifier.verify("not-a-jwt"), Err(AuthError::Malformed));
}

#[test]
fn bearer_extraction_covers_missing_and_malformed_headers() {
    assert_eq!(bearer_token(None), Err(AuthError::Missing));
    assert_eq!(bearer_token(Some("Basic abc")), Err(AuthError::Malformed));
    assert_eq!(bearer_token(Some("Bearer ")), Err(AuthError::Malformed));
    assert_eq!(bearer_token(Some("Bearer abc.def.ghi")), Ok("abc.def.ghi"));
}

#[tokio::test]
async fn unknown_subject_fails_the_full_check() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let verifier = TokenVerifier::new("secret", 60);

    let alice = storage.create_user("alice").await.expect("alice");
    let token = verifier.mint(alice).expect("mint");
    assert_eq!(
        authenticate(&storage, &verifier, &token)
            .await
            .expect("known"),
        alice
    );

    let ghost = verifier.mint(UserId(999)).expect("mint");
    let err = authenticate(&storage, &verifier, &ghost)
        .await
        .expect_err("unknown subject");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn storage_outage_is_not_a_credential_failure() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let verifier = TokenVerifier::new("secret", 60);
    let alice = storage.create_user("alice").await.expect("alice");
    let token = verifier.mint(alice).expect("mint");

    storage.pool().close().await;

    let err = authenticate(&storage, &verifier, &token)
        .await
        .expect_err("lookup should fail");
    assert_eq!(err.code, ErrorCode::Internal);
}
