//! End-to-end tests driving the runtime the way a node peer does: scripted
//! execution contexts on the far side of real in-process channels, and the
//! verb set exercised both directly and over a crosslink connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crosslink::{Crosslink, InProcessChannel, MultiPlexer, Tags};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use podlink::RuntimeConfig;
use podlink::cri::Runtime;
use podlink::cri::container::{ContextHandle, ContextSpawner, SpawnedContext};
use podlink::cri::image::ImageFetcher;
use podlink::cri::service::{CONTAINER_TAG, SANDBOX_TAG, mount_cri};
use podlink::cri::types::*;

const IMAGE_URL: &str = "http://images.example.com/app.wasm";
const IMAGE_BYTES: &[u8] = b"wasm-artifact";

struct MockFetcher;

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, String> {
        Ok(IMAGE_BYTES.to_vec())
    }
}

/// What the scripted context does after its `ready` handshake.
#[derive(Clone, Copy)]
enum Script {
    /// Report `finished` with this code right away.
    SelfExit(i32),
    /// Wait for `term`, then report `finished` with this code.
    ExitOnTerm(i32),
    /// Never answer `term`; forces the kill path.
    IgnoreTerm,
    /// Call `node/hello`, then exit 0 on success or 1 on failure.
    CallNode,
}

struct TaskHandle(JoinHandle<()>);

impl ContextHandle for TaskHandle {
    fn terminate(&mut self) {
        self.0.abort();
    }
}

/// Spawns contexts that run `Script` over a real channel pair, recording
/// every bootstrap payload they receive.
struct ScriptedSpawner {
    script: Script,
    spawned: AtomicUsize,
    readies: Arc<Mutex<Vec<ReadyResponse>>>,
}

impl ScriptedSpawner {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            spawned: AtomicUsize::new(0),
            readies: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn readies(&self) -> Vec<ReadyResponse> {
        self.readies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContextSpawner for ScriptedSpawner {
    async fn spawn(&self) -> Result<SpawnedContext, String> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (node_end, context_end) = InProcessChannel::pair();

        let script = self.script;
        let readies = self.readies.clone();

        let task = tokio::spawn(async move {
            let root = MultiPlexer::new();
            let manager = MultiPlexer::new();
            let (term_tx, mut term_rx) = mpsc::channel::<()>(1);
            manager.set_handler_fn("term", move |_, _, writer| {
                let term_tx = term_tx.clone();
                async move {
                    let _ = term_tx.send(()).await;
                    writer.reply_success(json!({})).await;
                    Ok(())
                }
            });
            root.set_handler("manager", Arc::new(manager));
            root.set_handler_fn("ping", |_, _, writer| async move {
                writer.reply_success(json!("pong")).await;
                Ok(())
            });

            let link = Arc::new(Crosslink::new(Arc::new(context_end), Arc::new(root)));

            let ready = link
                .call("manager/ready", json!({}), &Tags::new())
                .await
                .expect("ready handshake");
            let ready: ReadyResponse = serde_json::from_value(ready).expect("ready payload");
            readies.lock().unwrap().push(ready);

            let finish = |code: i32| {
                let link = link.clone();
                async move {
                    let _ = link
                        .call("manager/finished", json!({ "code": code }), &Tags::new())
                        .await;
                }
            };

            match script {
                Script::SelfExit(code) => finish(code).await,
                Script::ExitOnTerm(code) => {
                    let _ = term_rx.recv().await;
                    finish(code).await;
                }
                Script::IgnoreTerm => std::future::pending::<()>().await,
                Script::CallNode => {
                    let outcome = link.call("node/hello", json!({}), &Tags::new()).await;
                    finish(if outcome.is_ok() { 0 } else { 1 }).await;
                }
            }
        });

        Ok(SpawnedContext {
            channel: Arc::new(node_end),
            handle: Box::new(TaskHandle(task)),
        })
    }
}

fn test_runtime(script: Script) -> (Arc<Runtime>, Arc<ScriptedSpawner>) {
    let spawner = ScriptedSpawner::new(script);
    let runtime = Runtime::new(
        RuntimeConfig::default(),
        Arc::new(MockFetcher),
        spawner.clone(),
    );
    (runtime, spawner)
}

fn sandbox_request(name: &str, uid: &str, namespace: &str) -> RunPodSandboxRequest {
    RunPodSandboxRequest {
        config: PodSandboxConfig {
            metadata: PodSandboxMetadata {
                name: name.to_string(),
                uid: uid.to_string(),
                namespace: namespace.to_string(),
            },
        },
    }
}

fn container_request(sandbox_id: &str, name: &str) -> CreateContainerRequest {
    CreateContainerRequest {
        pod_sandbox_id: sandbox_id.to_string(),
        config: ContainerConfig {
            metadata: ContainerMetadata {
                name: name.to_string(),
            },
            image: ImageSpec {
                image: IMAGE_URL.to_string(),
            },
            runtime: vec!["go:1.19".to_string()],
            args: vec!["--mode".to_string(), "edge".to_string()],
            envs: vec![KeyValue {
                key: "REGION".to_string(),
                value: "jp".to_string(),
            }],
        },
    }
}

async fn provisioned(runtime: &Arc<Runtime>, name: &str) -> (String, String) {
    runtime
        .pull_image(PullImageRequest {
            image: ImageSpec {
                image: IMAGE_URL.to_string(),
            },
        })
        .await
        .unwrap();
    let sandbox_id = runtime
        .run_pod_sandbox(sandbox_request(name, &format!("uid-{name}"), "default"))
        .unwrap()
        .pod_sandbox_id;
    let container_id = runtime
        .create_container(container_request(&sandbox_id, "main"))
        .unwrap()
        .container_id;
    (sandbox_id, container_id)
}

async fn wait_for_state(runtime: &Arc<Runtime>, container_id: &str, state: ContainerState) {
    for _ in 0..500 {
        let status = runtime
            .container_status(ContainerStatusRequest {
                container_id: container_id.to_string(),
            })
            .unwrap();
        if status.status.state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("container {container_id} never reached {state:?}");
}

#[tokio::test]
async fn sandbox_names_and_uids_are_unique() {
    let (runtime, _) = test_runtime(Script::SelfExit(0));

    runtime
        .run_pod_sandbox(sandbox_request("pod", "u1", "default"))
        .unwrap();

    let err = runtime
        .run_pod_sandbox(sandbox_request("pod", "u2", "default"))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "already exists a sandbox with duplicate name/namespace"
    );

    let err = runtime
        .run_pod_sandbox(sandbox_request("other", "u1", "default"))
        .unwrap_err();
    assert_eq!(err.to_string(), "already exists a sandbox with duplicate uid");

    // same name in another namespace is fine
    runtime
        .run_pod_sandbox(sandbox_request("pod", "u3", "staging"))
        .unwrap();
}

#[tokio::test]
async fn create_container_requires_registered_image() {
    let (runtime, _) = test_runtime(Script::SelfExit(0));
    let sandbox_id = runtime
        .run_pod_sandbox(sandbox_request("pod", "u1", "default"))
        .unwrap()
        .pod_sandbox_id;

    let err = runtime
        .create_container(container_request(&sandbox_id, "main"))
        .unwrap_err();
    assert_eq!(err.to_string(), format!("image not found:{IMAGE_URL}"));
}

#[tokio::test]
async fn start_runs_the_bootstrap_handshake() {
    let (runtime, spawner) = test_runtime(Script::ExitOnTerm(0));
    let (_, container_id) = provisioned(&runtime, "pod").await;

    runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap();
    wait_for_state(&runtime, &container_id, ContainerState::Running).await;

    for _ in 0..500 {
        if !spawner.readies().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let readies = spawner.readies();
    assert_eq!(readies.len(), 1);
    assert_eq!(readies[0].name, IMAGE_URL);
    assert_eq!(readies[0].image, IMAGE_BYTES);
    assert_eq!(readies[0].args, vec!["--mode", "edge"]);
    assert_eq!(
        readies[0].envs,
        HashMap::from([("REGION".to_string(), "jp".to_string())])
    );

    let err = runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "container was already started");
}

#[tokio::test]
async fn container_exit_code_is_reported() {
    let (runtime, _) = test_runtime(Script::SelfExit(3));
    let (_, container_id) = provisioned(&runtime, "pod").await;

    runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap();
    wait_for_state(&runtime, &container_id, ContainerState::Exited).await;

    let status = runtime
        .container_status(ContainerStatusRequest {
            container_id: container_id.clone(),
        })
        .unwrap()
        .status;
    assert_eq!(status.exit_code, 3);
    assert!(!status.started_at.is_empty());
    assert!(!status.finished_at.is_empty());
}

#[tokio::test]
async fn stop_delivers_term_and_records_exit_code() {
    let (runtime, _) = test_runtime(Script::ExitOnTerm(5));
    let (_, container_id) = provisioned(&runtime, "pod").await;

    runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap();
    wait_for_state(&runtime, &container_id, ContainerState::Running).await;

    runtime
        .stop_container(StopContainerRequest {
            container_id: container_id.clone(),
        })
        .unwrap();
    wait_for_state(&runtime, &container_id, ContainerState::Exited).await;

    let status = runtime
        .container_status(ContainerStatusRequest {
            container_id: container_id.clone(),
        })
        .unwrap()
        .status;
    assert_eq!(status.exit_code, 5);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_container_is_force_killed_with_137() {
    let (runtime, _) = test_runtime(Script::IgnoreTerm);
    let (_, container_id) = provisioned(&runtime, "pod").await;

    runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap();
    wait_for_state(&runtime, &container_id, ContainerState::Running).await;

    runtime
        .stop_container(StopContainerRequest {
            container_id: container_id.clone(),
        })
        .unwrap();

    // past the 10s grace period
    tokio::time::sleep(Duration::from_secs(11)).await;

    let status = runtime
        .container_status(ContainerStatusRequest {
            container_id: container_id.clone(),
        })
        .unwrap()
        .status;
    assert_eq!(status.state, ContainerState::Exited);
    assert_eq!(status.exit_code, 137);
}

#[tokio::test]
async fn start_without_required_runtime_exits_immediately() {
    let spawner = ScriptedSpawner::new(Script::SelfExit(0));
    let runtime = Runtime::new(
        RuntimeConfig {
            supported_runtimes: vec!["wasm:1".to_string()],
            ..RuntimeConfig::default()
        },
        Arc::new(MockFetcher),
        spawner.clone(),
    );
    let (_, container_id) = provisioned(&runtime, "pod").await;

    runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap();

    let status = runtime
        .container_status(ContainerStatusRequest {
            container_id: container_id.clone(),
        })
        .unwrap()
        .status;
    assert_eq!(status.state, ContainerState::Exited);
    assert_eq!(status.exit_code, -1);
    assert_eq!(spawner.spawn_count(), 0);
}

#[tokio::test]
async fn removing_a_sandbox_cascades_to_its_containers() {
    let (runtime, _) = test_runtime(Script::SelfExit(0));
    let (sandbox_id, _) = provisioned(&runtime, "pod").await;
    runtime
        .create_container(container_request(&sandbox_id, "second"))
        .unwrap();

    let listed = runtime
        .list_containers(ListContainersRequest::default())
        .unwrap();
    assert_eq!(listed.containers.len(), 2);

    runtime
        .remove_pod_sandbox(RemovePodSandboxRequest {
            pod_sandbox_id: sandbox_id.clone(),
        })
        .unwrap();

    assert!(
        runtime
            .list_containers(ListContainersRequest::default())
            .unwrap()
            .containers
            .is_empty()
    );
    assert!(
        runtime
            .list_pod_sandbox(ListPodSandboxRequest::default())
            .unwrap()
            .items
            .is_empty()
    );
    // and it stays idempotent
    runtime
        .remove_pod_sandbox(RemovePodSandboxRequest {
            pod_sandbox_id: sandbox_id,
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_racing_remove_never_orphans_a_container() {
    let (runtime, _) = test_runtime(Script::SelfExit(0));
    runtime
        .pull_image(PullImageRequest {
            image: ImageSpec {
                image: IMAGE_URL.to_string(),
            },
        })
        .await
        .unwrap();

    for round in 0..200 {
        let sandbox_id = runtime
            .run_pod_sandbox(sandbox_request(
                &format!("pod-{round}"),
                &format!("uid-{round}"),
                "default",
            ))
            .unwrap()
            .pod_sandbox_id;

        let creator = {
            let runtime = runtime.clone();
            let request = container_request(&sandbox_id, "main");
            tokio::spawn(async move { runtime.create_container(request) })
        };
        let remover = {
            let runtime = runtime.clone();
            let sandbox_id = sandbox_id.clone();
            tokio::spawn(async move {
                runtime.remove_pod_sandbox(RemovePodSandboxRequest {
                    pod_sandbox_id: sandbox_id,
                })
            })
        };

        // either the create won (and the remove tore it down) or it lost
        // against the stopped sandbox; both are fine, a leftover is not
        let _ = creator.await.unwrap();
        remover.await.unwrap().unwrap();
        runtime
            .remove_pod_sandbox(RemovePodSandboxRequest {
                pod_sandbox_id: sandbox_id,
            })
            .unwrap();

        assert!(
            runtime
                .list_containers(ListContainersRequest::default())
                .unwrap()
                .containers
                .is_empty(),
            "round {round} left an orphaned container behind"
        );
    }

    assert!(
        runtime
            .list_pod_sandbox(ListPodSandboxRequest::default())
            .unwrap()
            .items
            .is_empty()
    );
}

#[tokio::test]
async fn list_filters_constrain_by_sandbox_and_state() {
    let (runtime, _) = test_runtime(Script::ExitOnTerm(0));
    let (first_sandbox, first_container) = provisioned(&runtime, "one").await;
    let second_sandbox = runtime
        .run_pod_sandbox(sandbox_request("two", "uid-two", "default"))
        .unwrap()
        .pod_sandbox_id;
    runtime
        .create_container(container_request(&second_sandbox, "main"))
        .unwrap();

    runtime
        .start_container(StartContainerRequest {
            container_id: first_container.clone(),
        })
        .await
        .unwrap();
    wait_for_state(&runtime, &first_container, ContainerState::Running).await;

    let by_sandbox = runtime
        .list_containers(ListContainersRequest {
            filter: Some(ContainerFilter {
                pod_sandbox_id: Some(first_sandbox.clone()),
                ..ContainerFilter::default()
            }),
        })
        .unwrap();
    assert_eq!(by_sandbox.containers.len(), 1);
    assert_eq!(by_sandbox.containers[0].id, first_container);

    let running = runtime
        .list_containers(ListContainersRequest {
            filter: Some(ContainerFilter {
                state: Some(ContainerStateValue {
                    state: ContainerState::Running,
                }),
                ..ContainerFilter::default()
            }),
        })
        .unwrap();
    assert_eq!(running.containers.len(), 1);

    // empty-string constraints are no constraint at all
    let all = runtime
        .list_containers(ListContainersRequest {
            filter: Some(ContainerFilter {
                id: Some(String::new()),
                ..ContainerFilter::default()
            }),
        })
        .unwrap();
    assert_eq!(all.containers.len(), 2);

    let by_id = runtime
        .list_pod_sandbox(ListPodSandboxRequest {
            filter: Some(PodSandboxFilter {
                id: Some(second_sandbox.clone()),
                state: None,
            }),
        })
        .unwrap();
    assert_eq!(by_id.items.len(), 1);
    assert_eq!(by_id.items[0].id, second_sandbox);
}

#[tokio::test]
async fn stopping_a_sandbox_makes_it_not_ready_for_new_containers() {
    let (runtime, _) = test_runtime(Script::SelfExit(0));
    let (sandbox_id, _) = provisioned(&runtime, "pod").await;

    runtime
        .stop_pod_sandbox(StopPodSandboxRequest {
            pod_sandbox_id: sandbox_id.clone(),
        })
        .unwrap();

    let status = runtime
        .pod_sandbox_status(PodSandboxStatusRequest {
            pod_sandbox_id: sandbox_id.clone(),
        })
        .unwrap();
    assert_eq!(status.status.state, PodSandboxState::NotReady);

    let err = runtime
        .create_container(container_request(&sandbox_id, "late"))
        .unwrap_err();
    assert_eq!(err.to_string(), "sandbox is not ready");
}

#[tokio::test]
async fn verbs_are_reachable_over_crosslink() {
    let (runtime, _) = test_runtime(Script::SelfExit(0));
    let root = MultiPlexer::new();
    mount_cri(&root, &runtime);

    let (near, far) = InProcessChannel::pair();
    let _server = Crosslink::new(Arc::new(far), Arc::new(root));
    let client = Crosslink::new(Arc::new(near), Arc::new(MultiPlexer::new()));

    let reply = client
        .call(
            "cri/pullImage",
            json!({ "image": { "image": IMAGE_URL } }),
            &Tags::new(),
        )
        .await
        .unwrap();
    let image_ref = reply["imageRef"].as_str().unwrap().to_string();
    assert!(!image_ref.is_empty());

    let reply = client
        .call(
            "cri/runPodSandbox",
            json!({ "config": { "metadata": {
                "name": "pod", "uid": "u1", "namespace": "default"
            } } }),
            &Tags::new(),
        )
        .await
        .unwrap();
    let sandbox_id = reply["podSandboxId"].as_str().unwrap().to_string();

    // bare call: the request record is all-default
    let reply = client
        .call("cri/listImages", Value::Null, &Tags::new())
        .await
        .unwrap();
    assert_eq!(reply["images"][0]["id"], image_ref);
    assert_eq!(reply["images"][0]["spec"]["image"], IMAGE_URL);

    let err = client
        .call("cri/runPodSandbox", json!({ "config": 5 }), &Tags::new())
        .await
        .unwrap_err();
    assert!(
        err.to_string().starts_with("malformed runPodSandbox request:"),
        "unexpected error: {err}"
    );

    let err = client
        .call("cri/bogusVerb", Value::Null, &Tags::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "handler not found. path:cri/bogusVerb");

    let err = client
        .call(
            "cri/podSandboxStatus",
            json!({ "podSandboxId": "missing" }),
            &Tags::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "sandbox not found");

    let reply = client
        .call(
            "cri/podSandboxStatus",
            json!({ "podSandboxId": sandbox_id }),
            &Tags::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply["status"]["state"], "ready");
}

#[tokio::test]
async fn application_pipe_forwards_into_the_tagged_container() {
    let (runtime, _) = test_runtime(Script::ExitOnTerm(0));
    let (_, container_id) = provisioned(&runtime, "pod").await;
    runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap();
    wait_for_state(&runtime, &container_id, ContainerState::Running).await;

    let root = MultiPlexer::new();
    mount_cri(&root, &runtime);
    let (near, far) = InProcessChannel::pair();
    let _server = Crosslink::new(Arc::new(far), Arc::new(root));
    let client = Crosslink::new(Arc::new(near), Arc::new(MultiPlexer::new()));

    let mut tags = Tags::new();
    tags.insert(CONTAINER_TAG.to_string(), container_id.clone());
    let reply = client
        .call("application/ping", Value::Null, &tags)
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));

    // unknown container id is answered with an error, not silence
    let mut tags = Tags::new();
    tags.insert(CONTAINER_TAG.to_string(), "nope".to_string());
    let err = client
        .call("application/ping", Value::Null, &tags)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "container isn't exist:nope");
}

#[tokio::test]
async fn node_pipe_stamps_origin_tags_on_outbound_calls() {
    let (runtime, _) = test_runtime(Script::CallNode);

    let seen: Arc<Mutex<Vec<Tags>>> = Arc::new(Mutex::new(Vec::new()));
    let controller = MultiPlexer::new();
    let seen_by_handler = seen.clone();
    controller.set_handler_fn("hello", move |_, tags, writer| {
        let seen = seen_by_handler.clone();
        async move {
            seen.lock().unwrap().push(tags);
            writer.reply_success(json!({})).await;
            Ok(())
        }
    });
    let (runtime_end, controller_end) = InProcessChannel::pair();
    let _controller_link = Crosslink::new(Arc::new(controller_end), Arc::new(controller));
    runtime.set_node_link(Arc::new(Crosslink::new(
        Arc::new(runtime_end),
        Arc::new(MultiPlexer::new()),
    )));

    let (sandbox_id, container_id) = provisioned(&runtime, "pod").await;
    runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .unwrap();

    // CallNode exits 0 once the node call round-trips
    wait_for_state(&runtime, &container_id, ContainerState::Exited).await;
    let status = runtime
        .container_status(ContainerStatusRequest {
            container_id: container_id.clone(),
        })
        .unwrap()
        .status;
    assert_eq!(status.exit_code, 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get(SANDBOX_TAG), Some(&sandbox_id));
    assert_eq!(seen[0].get(CONTAINER_TAG), Some(&container_id));
}
