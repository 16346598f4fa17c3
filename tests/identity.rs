//! Identity integration tests
//!
//! User and role names must stay unique across everything a unit of work can
//! see: committed rows, its own staged creates, and rows another unit commits
//! while this one is still open.

use pricepoint_auth::errors::{IdentityError, StorageError};
use pricepoint_auth::identity::{ApplicationRole, ApplicationUser, Argon2PasswordHasher};
use pricepoint_auth::storage::{
    Entity, MemorySessionFactory, MemoryStore, SaveChangesResult, UnitOfWork,
};
use std::sync::Arc;

const PASSWORD: &str = "Sup3r-Secret";

async fn open(factory: &MemorySessionFactory) -> UnitOfWork {
    UnitOfWork::open(factory, Arc::new(Argon2PasswordHasher))
        .await
        .unwrap()
}

fn assert_constraint_violation(uow: &UnitOfWork) {
    assert!(matches!(
        uow.last_save_changes_result(),
        SaveChangesResult::Failed(StorageError::ConstraintViolation(_))
    ));
}

#[tokio::test]
async fn test_user_name_taken_by_staged_user_is_rejected() {
    let factory = MemorySessionFactory::new(MemoryStore::new());
    let uow = open(&factory).await;
    let users = uow.user_manager().unwrap();

    users
        .create(ApplicationUser::new("alice", None), PASSWORD)
        .await
        .unwrap();
    match users
        .create(ApplicationUser::new("ALICE", None), PASSWORD)
        .await
    {
        Err(IdentityError::DuplicateUserName(name)) => assert_eq!(name, "ALICE"),
        other => panic!("expected DuplicateUserName, got {:?}", other),
    }

    assert_eq!(uow.save_changes(false).await.unwrap(), 1);
    assert_eq!(factory.store().count(ApplicationUser::SET), 1);
}

#[tokio::test]
async fn test_email_taken_by_staged_user_is_rejected() {
    let factory = MemorySessionFactory::new(MemoryStore::new());
    let uow = open(&factory).await;
    let users = uow.user_manager().unwrap();

    users
        .create(ApplicationUser::new("alice", Some("alice@pricepoint.io")), PASSWORD)
        .await
        .unwrap();
    let result = users
        .create(ApplicationUser::new("bob", Some("ALICE@pricepoint.io")), PASSWORD)
        .await;
    assert!(matches!(result, Err(IdentityError::DuplicateEmail(_))));
}

#[tokio::test]
async fn test_user_name_committed_by_another_unit_fails_the_commit() {
    let factory = MemorySessionFactory::new(MemoryStore::new());
    let first = open(&factory).await;
    let second = open(&factory).await;

    // Both units validate before either commits, so neither sees the other.
    first
        .user_manager()
        .unwrap()
        .create(ApplicationUser::new("alice", None), PASSWORD)
        .await
        .unwrap();
    second
        .user_manager()
        .unwrap()
        .create(ApplicationUser::new("ALICE", None), PASSWORD)
        .await
        .unwrap();

    assert_eq!(first.save_changes(false).await.unwrap(), 1);
    assert_eq!(second.save_changes(false).await.unwrap(), 0);
    assert_constraint_violation(&second);
    assert_eq!(factory.store().count(ApplicationUser::SET), 1);
}

#[tokio::test]
async fn test_role_name_taken_by_staged_role_is_rejected() {
    let factory = MemorySessionFactory::new(MemoryStore::new());
    let uow = open(&factory).await;
    let roles = uow.role_manager().unwrap();

    roles.create(&ApplicationRole::new("Manager")).await.unwrap();
    match roles.create(&ApplicationRole::new("manager")).await {
        Err(IdentityError::DuplicateRoleName(name)) => assert_eq!(name, "manager"),
        other => panic!("expected DuplicateRoleName, got {:?}", other),
    }
}

#[tokio::test]
async fn test_role_name_committed_by_another_unit_fails_the_commit() {
    let factory = MemorySessionFactory::new(MemoryStore::new());
    let first = open(&factory).await;
    let second = open(&factory).await;

    first
        .role_manager()
        .unwrap()
        .create(&ApplicationRole::new("Manager"))
        .await
        .unwrap();
    second
        .role_manager()
        .unwrap()
        .create(&ApplicationRole::new("MANAGER"))
        .await
        .unwrap();

    assert_eq!(first.save_changes(false).await.unwrap(), 1);
    assert_eq!(second.save_changes(false).await.unwrap(), 0);
    assert_constraint_violation(&second);
    assert_eq!(factory.store().count(ApplicationRole::SET), 1);
}

#[tokio::test]
async fn test_user_joins_role_created_in_the_same_unit() {
    let factory = MemorySessionFactory::new(MemoryStore::new());
    let uow = open(&factory).await;
    let users = uow.user_manager().unwrap();

    uow.role_manager()
        .unwrap()
        .create(&ApplicationRole::new("Manager"))
        .await
        .unwrap();
    let user = users
        .create(ApplicationUser::new("alice", None), PASSWORD)
        .await
        .unwrap();

    users.add_to_role(&user, "manager").await.unwrap();
    assert!(users.is_in_role(&user, "Manager").await.unwrap());
    assert_eq!(uow.save_changes(false).await.unwrap(), 3);

    let reopened = open(&factory).await;
    let users = reopened.user_manager().unwrap();
    let user = users.find_by_name("alice").await.unwrap().unwrap();
    assert_eq!(users.roles_of(&user).await.unwrap(), vec!["Manager"]);
}
