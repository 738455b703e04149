use ps_ingestion::config::{Deployment, StorageConfig};
use ps_ingestion::stages::SimulatedInvoker;
use ps_ingestion::{ArtifactRef, Format, StageErrorKind, StageInput, StageInvoker, StageName};

fn storage() -> StorageConfig {
    StorageConfig::for_deployment(Deployment::Dev)
}

#[tokio::test]
async fn simulated_stages_chain_format_namespaced_refs() {
    let invoker = SimulatedInvoker::new(storage());

    let raw = invoker
        .invoke(StageName::Extract, &StageInput::Format(Format::Vgc))
        .await
        .unwrap();
    assert!(raw.as_str().starts_with("s3://ps-ingestion-replays-dev/vgc/"));
    assert!(raw.as_str().ends_with(".json"));

    let processed = invoker
        .invoke(StageName::Transform, &StageInput::Artifact(raw.clone()))
        .await
        .unwrap();
    let key = raw.as_str().trim_start_matches("s3://ps-ingestion-replays-dev/");
    assert_eq!(
        processed.as_str(),
        format!("s3://ps-ingestion-teams-dev/{key}")
    );

    let loaded = invoker
        .invoke(StageName::Load, &StageInput::Artifact(processed))
        .await
        .unwrap();
    assert_eq!(
        loaded.as_str(),
        format!(
            "dynamodb://PsIngestionTeams-dev/{}",
            key.trim_end_matches(".json")
        )
    );
}

#[tokio::test]
async fn simulated_stage_rejects_mismatched_input() {
    let invoker = SimulatedInvoker::new(storage());

    let err = invoker
        .invoke(StageName::Transform, &StageInput::Format(Format::Ou))
        .await
        .unwrap_err();
    assert_eq!(err.kind, StageErrorKind::Permanent);

    let err = invoker
        .invoke(
            StageName::Load,
            &StageInput::Artifact(ArtifactRef::new("not-a-location")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, StageErrorKind::Permanent);
}

#[cfg(unix)]
mod command {
    use std::time::Duration;

    use ps_ingestion::stage::invoke_with_timeout;
    use ps_ingestion::stages::{CommandInvoker, EXIT_TEMPFAIL};
    use ps_ingestion::{
        ArtifactRef, Format, StageErrorKind, StageInput, StageInvoker, StageName,
    };
    use tempfile::tempdir;

    use super::storage;

    fn shell(script: &str) -> CommandInvoker {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        CommandInvoker::new(&argv, &storage()).unwrap()
    }

    #[tokio::test]
    async fn last_stdout_line_is_the_artifact() {
        let invoker = shell(r#"echo "working on $PS_INGESTION_INPUT"; echo "s3://$REPLAYS_BUCKET_NAME/ou/x.json""#);

        let artifact = invoker
            .invoke(StageName::Extract, &StageInput::Format(Format::Ou))
            .await
            .unwrap();
        assert_eq!(artifact.as_str(), "s3://ps-ingestion-replays-dev/ou/x.json");
    }

    #[tokio::test]
    async fn tempfail_exit_is_transient() {
        let invoker = shell(&format!("echo 'throttled' >&2; exit {EXIT_TEMPFAIL}"));

        let err = invoker
            .invoke(StageName::Load, &StageInput::Format(Format::Ou))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Transient);
        assert_eq!(err.message, "throttled");
    }

    #[tokio::test]
    async fn other_exit_codes_are_permanent() {
        let invoker = shell("exit 2");

        let err = invoker
            .invoke(StageName::Extract, &StageInput::Format(Format::Vgc))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Permanent);
        assert!(err.message.contains("exited with status 2"));
    }

    #[tokio::test]
    async fn empty_success_output_is_permanent() {
        let invoker = shell("true");

        let err = invoker
            .invoke(StageName::Extract, &StageInput::Format(Format::Vgc))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Permanent);
    }

    #[tokio::test]
    async fn missing_program_is_permanent() {
        let argv = vec!["ps-ingestion-no-such-program".to_string()];
        let invoker = CommandInvoker::new(&argv, &storage()).unwrap();

        let err = invoker
            .invoke(StageName::Extract, &StageInput::Format(Format::Ou))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Permanent);
        assert!(err.message.contains("failed to launch"));
    }

    #[tokio::test]
    async fn storage_names_and_stage_are_exported() {
        let invoker = shell(r#"echo "$PS_INGESTION_STAGE $TEAMS_BUCKET_NAME $TABLE_NAME $0""#);
        let input = StageInput::Artifact(ArtifactRef::new("s3://ps-ingestion-teams-dev/ou/x.json"));

        let artifact = invoker.invoke(StageName::Load, &input).await.unwrap();
        assert_eq!(
            artifact.as_str(),
            "load ps-ingestion-teams-dev PsIngestionTeams-dev s3://ps-ingestion-teams-dev/ou/x.json"
        );
    }

    #[tokio::test]
    async fn timed_out_command_is_killed() {
        let temp = tempdir().unwrap();
        let marker = temp.path().join("finished");
        let invoker = shell(&format!("sleep 1; touch '{}'", marker.display()));

        let err = invoke_with_timeout(
            &invoker,
            StageName::Extract,
            &StageInput::Format(Format::Ou),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Transient);
        assert_eq!(err.message, "timed out after 0.200s");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn killed_by_signal_is_transient() {
        let invoker = shell("kill -9 $$");

        let err = invoker
            .invoke(StageName::Transform, &StageInput::Format(Format::Ou))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Transient);
        assert!(err.message.contains("terminated by a signal"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandInvoker::new(&[], &storage()).is_err());
    }
}
