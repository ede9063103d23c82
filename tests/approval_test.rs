mod common;

use anyhow::anyhow;
use common::{tenants, FakeLlm, RecordingGateway, Sent};
use newsdesk::approval::{ApprovalDesk, ApprovalError, PublishOutcome, PublishRequest, Review};
use newsdesk::events::{bot_channels, BotCommand, CallbackEvent, CommandEvent, LogBus, MessageEvent};
use newsdesk::model::PostState;
use newsdesk::transform::{EmojiEntity, ImageOverrides};
use std::sync::Arc;
use tokio::sync::Semaphore;

fn desk(gateway: &RecordingGateway, llm: &FakeLlm) -> ApprovalDesk {
    ApprovalDesk::new(
        tenants(),
        Arc::new(gateway.clone()),
        Arc::new(llm.clone()),
        LogBus::default(),
    )
}

fn request(instance: &str, text: &str) -> PublishRequest {
    PublishRequest {
        login: "root".into(),
        channel: "@news".into(),
        text: Some(text.into()),
        media: None,
        instance_id: Some(instance.into()),
        id: None,
    }
}

fn awaiting_id(outcome: PublishOutcome) -> String {
    match outcome {
        PublishOutcome::Awaiting { id } => id,
        other => panic!("expected awaiting, got {:?}", other),
    }
}

fn callback(id: &str, data: String) -> CallbackEvent {
    CallbackEvent {
        callback_id: id.into(),
        from_id: "1".into(),
        data,
        message: Some((1, 55)),
    }
}

#[tokio::test]
async fn fails_fast_without_active_approvers() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());

    let err = desk.publish_request(request("news", "Hello")).await.unwrap_err();
    assert!(matches!(err, ApprovalError::NoActiveApprovers));
    assert_eq!(err.to_string(), "no active approvers");
    assert!(desk.list_awaiting().await.is_empty());
    assert!(gateway.sent().await.is_empty());
}

#[tokio::test]
async fn validates_channel_content_and_tenant() {
    let desk = desk(&RecordingGateway::default(), &FakeLlm::default());
    desk.start_approving("1", Some("Alice")).await;

    let mut req = request("news", "x");
    req.channel = " ".into();
    assert!(matches!(
        desk.publish_request(req).await,
        Err(ApprovalError::MissingChannel)
    ));

    let mut req = request("news", "");
    req.media = Some("".into());
    assert!(matches!(
        desk.publish_request(req).await,
        Err(ApprovalError::MissingContent)
    ));

    let mut req = request("news", "x");
    req.login = "ghost".into();
    assert!(matches!(
        desk.publish_request(req).await,
        Err(ApprovalError::UnknownTenant(_))
    ));
}

#[tokio::test]
async fn queued_post_prompts_only_eligible_approvers() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    assert!(desk.start_approving("1", Some("Alice")).await);
    assert!(desk.start_approving("2", Some("bob")).await);

    let id = awaiting_id(desk.publish_request(request("news", "Hi 😀")).await.unwrap());

    let prompts = gateway.prompts().await;
    assert_eq!(
        prompts,
        vec![Sent::Text {
            target: "1".into(),
            text: "Approve post to @news?\nHi <tg-emoji emoji-id=\"100\">😀</tg-emoji>\nReplaced: 😀"
                .into(),
            buttons: Some(id.clone()),
        }]
    );
    let queued = desk.list_awaiting().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, id);
    assert_eq!(queued[0].state, PostState::Queued);
    assert_eq!(queued[0].text, "Hi 😀");
}

#[tokio::test]
async fn instance_without_list_uses_global_union() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("1", Some("alice")).await;
    desk.start_approving("2", Some("Bob")).await;

    let mut req = request("open", "Plain");
    req.id = Some("custom-id".into());
    let id = awaiting_id(desk.publish_request(req).await.unwrap());
    assert_eq!(id, "custom-id");

    let targets: Vec<String> = gateway
        .prompts()
        .await
        .iter()
        .filter_map(|s| s.target().map(str::to_string))
        .collect();
    assert_eq!(targets, vec!["1".to_string(), "2".to_string()]);
}

#[tokio::test]
async fn active_but_ineligible_publishes_immediately() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("2", Some("bob")).await;

    let outcome = desk.publish_request(request("news", "Hi 😀")).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Published);
    assert!(desk.list_awaiting().await.is_empty());
    assert_eq!(
        gateway.plain_to("@news").await,
        vec![Sent::Text {
            target: "@news".into(),
            text: "Hi <tg-emoji emoji-id=\"100\">😀</tg-emoji>\n\nvia @newsdesk".into(),
            buttons: None,
        }]
    );
}

#[tokio::test]
async fn approve_sends_video_for_mp4_media() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("1", Some("alice")).await;

    let mut req = request("news", "Clip");
    req.media = Some("https://cdn.example/clip.mp4".into());
    let id = awaiting_id(desk.publish_request(req).await.unwrap());
    desk.approve(&id).await.unwrap();

    assert_eq!(
        gateway.plain_to("@news").await,
        vec![Sent::Video {
            target: "@news".into(),
            video: "https://cdn.example/clip.mp4".into(),
            caption: "Clip\n\nvia @newsdesk".into(),
            buttons: None,
        }]
    );
    assert!(matches!(desk.approve(&id).await, Err(ApprovalError::NotFound)));
}

#[tokio::test]
async fn cancel_is_idempotent_and_never_publishes() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("1", Some("alice")).await;

    let id = awaiting_id(desk.publish_request(request("news", "Bye")).await.unwrap());
    desk.cancel(&id).await.unwrap();
    assert!(matches!(desk.cancel(&id).await, Err(ApprovalError::NotFound)));
    assert!(desk.list_awaiting().await.is_empty());
    assert!(gateway.plain_to("@news").await.is_empty());
}

#[tokio::test]
async fn duplicate_id_is_rejected_while_queued() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("1", Some("alice")).await;

    let mut first = request("news", "First");
    first.id = Some("p1".into());
    desk.publish_request(first).await.unwrap();
    let prompts = gateway.prompts().await.len();

    let mut second = request("news", "Second");
    second.id = Some("p1".into());
    let err = desk.publish_request(second).await.unwrap_err();
    assert!(matches!(err, ApprovalError::DuplicateId(ref id) if id == "p1"));
    assert_eq!(desk.get("p1").await.unwrap().text, "First");
    assert_eq!(gateway.prompts().await.len(), prompts);

    desk.cancel("p1").await.unwrap();
    let mut third = request("news", "Third");
    third.id = Some("p1".into());
    assert_eq!(
        awaiting_id(desk.publish_request(third).await.unwrap()),
        "p1"
    );
}

#[tokio::test]
async fn request_image_keeps_id_and_reprompts() {
    let gateway = RecordingGateway::default();
    let llm = FakeLlm::with_images(vec![Ok("https://img/new.png".into())]);
    let desk = desk(&gateway, &llm);
    desk.start_approving("1", Some("alice")).await;

    let id = awaiting_id(desk.publish_request(request("news", "Story")).await.unwrap());
    let updated = desk
        .request_image(&id, &ImageOverrides::default())
        .await
        .unwrap();

    assert_eq!(updated.id, id);
    assert_eq!(updated.media.as_deref(), Some("https://img/new.png"));
    assert_eq!(updated.state, PostState::Queued);
    assert_eq!(desk.list_awaiting().await.len(), 1);

    let requests = llm.image_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, "dall-e-3");
    assert!(requests[0].prompt.contains("Story"));

    let prompts = gateway.prompts().await;
    assert_eq!(prompts.len(), 2);
    match &prompts[1] {
        Sent::Photo { target, photo, .. } => {
            assert_eq!(target, "1");
            assert_eq!(photo, "https://img/new.png");
        }
        other => panic!("expected photo prompt, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_image_restores_original_media() {
    let gateway = RecordingGateway::default();
    let llm = FakeLlm::with_images(vec![Err(anyhow!("quota exceeded"))]);
    let desk = desk(&gateway, &llm);
    desk.start_approving("1", Some("alice")).await;

    let mut req = request("news", "Story");
    req.media = Some("https://img/old.png".into());
    let id = awaiting_id(desk.publish_request(req).await.unwrap());

    let err = desk
        .request_image(&id, &ImageOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Llm(_)));
    assert!(err.to_string().contains("quota exceeded"));

    let post = desk.get(&id).await.unwrap();
    assert_eq!(post.state, PostState::Queued);
    assert_eq!(post.media.as_deref(), Some("https://img/old.png"));
    assert_eq!(gateway.prompts().await.len(), 1);
}

#[tokio::test]
async fn concurrent_image_request_is_busy_and_rechecks_after_generation() {
    let gateway = RecordingGateway::default();
    let gate = Arc::new(Semaphore::new(0));
    let llm = FakeLlm::default().gated(Arc::clone(&gate));
    let desk = Arc::new(desk(&gateway, &llm));
    desk.start_approving("1", Some("alice")).await;

    let mut req = request("news", "Story");
    req.id = Some("p1".into());
    desk.publish_request(req).await.unwrap();

    let pending = {
        let desk = Arc::clone(&desk);
        tokio::spawn(async move { desk.request_image("p1", &ImageOverrides::default()).await })
    };
    loop {
        if desk.get("p1").await.map(|p| p.state) == Some(PostState::ImageRequested) {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        desk.request_image("p1", &ImageOverrides::default()).await,
        Err(ApprovalError::Busy)
    ));

    desk.cancel("p1").await.unwrap();
    gate.add_permits(1);
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ApprovalError::NotFound)));
    assert!(desk.list_awaiting().await.is_empty());
    assert_eq!(gateway.prompts().await.len(), 1);
}

#[tokio::test]
async fn approve_callback_answers_and_deletes_prompt() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("1", Some("alice")).await;
    let id = awaiting_id(desk.publish_request(request("news", "Hello")).await.unwrap());

    desk.handle_callback(callback("cb1", format!("approve:{}", id)))
        .await;
    desk.handle_callback(callback("cb2", format!("approve:{}", id)))
        .await;

    let sent = gateway.sent().await;
    assert!(sent.contains(&Sent::Answered {
        callback_id: "cb1".into(),
        text: Some("Approved".into()),
    }));
    assert!(sent.contains(&Sent::Answered {
        callback_id: "cb2".into(),
        text: Some("Post not found".into()),
    }));
    assert!(sent.contains(&Sent::Deleted {
        chat_id: 1,
        message_id: 55,
    }));
    assert_eq!(gateway.plain_to("@news").await.len(), 1);
}

#[tokio::test]
async fn failed_publish_is_reported_on_callback() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("1", Some("alice")).await;
    let id = awaiting_id(desk.publish_request(request("news", "Hello")).await.unwrap());
    gateway.fail_for("@news").await;

    desk.handle_callback(callback("cb1", format!("approve:{}", id)))
        .await;

    assert!(gateway.sent().await.contains(&Sent::Answered {
        callback_id: "cb1".into(),
        text: Some("Failed to post".into()),
    }));
    assert!(desk.list_awaiting().await.is_empty());
}

#[tokio::test]
async fn cancel_callback_answers_cancelled() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());
    desk.start_approving("1", Some("alice")).await;
    let id = awaiting_id(desk.publish_request(request("news", "Hello")).await.unwrap());

    desk.handle_callback(callback("cb1", format!("cancel:{}", id)))
        .await;

    assert!(gateway.sent().await.contains(&Sent::Answered {
        callback_id: "cb1".into(),
        text: Some("Cancelled".into()),
    }));
    assert!(desk.get(&id).await.is_none());
}

#[tokio::test]
async fn image_callback_failure_notifies_requester_only() {
    let gateway = RecordingGateway::default();
    let llm = FakeLlm::with_images(vec![Err(anyhow!("boom"))]);
    let desk = desk(&gateway, &llm);
    desk.start_approving("1", Some("alice")).await;
    desk.start_approving("2", Some("bob")).await;
    let mut req = request("open", "Story");
    req.id = Some("p1".into());
    desk.publish_request(req).await.unwrap();

    desk.handle_callback(callback("cb1", "approve_image:p1".into()))
        .await;

    assert!(gateway.sent().await.contains(&Sent::Answered {
        callback_id: "cb1".into(),
        text: Some("Generating image...".into()),
    }));
    let failure = Sent::Text {
        target: "1".into(),
        text: "Failed to generate image.".into(),
        buttons: None,
    };
    let generating = Sent::Text {
        target: "1".into(),
        text: "Generating image...".into(),
        buttons: None,
    };
    let to_requester = gateway.plain_to("1").await;
    let started = to_requester.iter().position(|s| *s == generating);
    let failed = to_requester.iter().position(|s| *s == failure);
    assert!(started.is_some() && failed.is_some());
    assert!(started < failed);
    assert!(!gateway
        .plain_to("2")
        .await
        .iter()
        .any(|s| matches!(s, Sent::Text { text, .. } if text.contains("image"))));
    assert_eq!(desk.get("p1").await.unwrap().state, PostState::Queued);
}

#[tokio::test]
async fn reviewed_submission_rejects_low_scores() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::with_completions(&["Score: 3 of 10"]));
    desk.start_approving("1", Some("alice")).await;

    let review = Review {
        filter_id: Some("relevance".into()),
        author_id: None,
    };
    let outcome = desk
        .submit_reviewed(request("news", "meh"), review)
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Rejected { score: 3.0 });
    assert!(desk.list_awaiting().await.is_empty());
}

#[tokio::test]
async fn reviewed_submission_rewrites_before_queueing() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::with_completions(&["9", "Rewritten body"]));
    desk.start_approving("1", Some("alice")).await;

    let review = Review {
        filter_id: Some("relevance".into()),
        author_id: Some("editor".into()),
    };
    let id = awaiting_id(
        desk.submit_reviewed(request("news", "draft"), review)
            .await
            .unwrap(),
    );
    assert_eq!(desk.get(&id).await.unwrap().text, "Rewritten body");
}

#[tokio::test]
async fn scoring_failure_is_surfaced_not_passed() {
    let llm = FakeLlm::default();
    llm.fail_next_completion("upstream down").await;
    let desk = desk(&RecordingGateway::default(), &llm);
    desk.start_approving("1", Some("alice")).await;

    let review = Review {
        filter_id: Some("relevance".into()),
        author_id: None,
    };
    let err = desk
        .submit_reviewed(request("news", "text"), review)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Llm(_)));
    assert_eq!(err.to_string(), "upstream down");
    assert!(desk.list_awaiting().await.is_empty());

    let missing = desk.evaluate_filter("root", "nope", "t").await.unwrap_err();
    assert!(matches!(missing, ApprovalError::UnknownFilter(_)));
}

#[tokio::test]
async fn approver_commands_follow_the_global_list() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());

    assert!(!desk.start_approving("9", Some("mallory")).await);
    assert!(!desk.start_approving("8", None).await);
    assert_eq!(
        gateway.plain_to("9").await,
        vec![Sent::Text {
            target: "9".into(),
            text: "You are not an approver.".into(),
            buttons: None,
        }]
    );

    assert!(desk.start_approving("1", Some("ALICE")).await);
    assert_eq!(
        desk.active_approvers().await.get("1").map(String::as_str),
        Some("alice")
    );
    assert!(desk.stop_approving("1").await);
    assert!(desk.active_approvers().await.is_empty());
    assert!(matches!(
        desk.publish_request(request("news", "x")).await,
        Err(ApprovalError::NoActiveApprovers)
    ));
}

#[tokio::test]
async fn emoji_pack_merges_into_approver_tenants() {
    let gateway = RecordingGateway::default();
    let desk = desk(&gateway, &FakeLlm::default());

    assert!(desk.add_emojis("1", Some("alice")).await);
    let pack = MessageEvent {
        from_id: "1".into(),
        text: "🔥 - x".into(),
        custom_emojis: vec![EmojiEntity {
            offset: 5,
            custom_emoji_id: "777".into(),
        }],
    };
    assert_eq!(desk.handle_message(pack.clone()).await, 1);
    assert_eq!(
        desk.emojis("root").await.unwrap().get("🔥").map(String::as_str),
        Some("777")
    );
    assert!(desk.emojis("other").await.unwrap().is_empty());
    assert!(gateway.plain_to("1").await.contains(&Sent::Text {
        target: "1".into(),
        text: "Added 1 custom emojis.".into(),
        buttons: None,
    }));

    // The flow is one-shot.
    assert_eq!(desk.handle_message(pack).await, 0);
    assert!(!desk.add_emojis("9", Some("mallory")).await);
}

#[tokio::test]
async fn run_consumes_bot_events_until_senders_drop() {
    let gateway = RecordingGateway::default();
    let desk = Arc::new(desk(&gateway, &FakeLlm::default()));
    let (tx, rx) = bot_channels(8);
    let task = tokio::spawn(Arc::clone(&desk).run(rx));

    tx.commands
        .send(CommandEvent {
            from_id: "1".into(),
            username: Some("Alice".into()),
            command: BotCommand::StartApproving,
        })
        .await
        .unwrap();
    drop(tx);
    task.await.unwrap();

    assert_eq!(
        desk.active_approvers().await.get("1").map(String::as_str),
        Some("alice")
    );
}
