//! Integration tests for memory bindings, external allocators and remapping

mod common;

use common::*;
use graphrt_core::{
    AddressRangeReconciler, DType, DeviceBackend, DevicePtr, MemoryType, Options, RegionKind, SessionError,
    Tensor, TensorDesc,
};
use std::sync::Arc;

const CONST_SIZE: usize = 128;

#[tokio::test]
async fn test_bindings_require_compiled_graph() {
    let h = Harness::initialized().await;
    h.session.add_graph(1, static_graph(), Options::new()).unwrap();

    assert_eq!(
        h.session
            .set_graph_const_memory_base(1, DevicePtr(0x2000), CONST_SIZE)
            .await,
        Err(SessionError::NotBuilt(1))
    );
    assert_eq!(
        h.session
            .update_graph_feature_memory_base(2, DevicePtr(0x2000), 64)
            .await,
        Err(SessionError::NotFound(2))
    );
}

#[tokio::test]
async fn test_const_memory_rules() {
    let h = Harness::initialized().await;
    let session = &h.session;
    session.add_graph(1, static_graph(), Options::new()).unwrap();
    session.compile_graph(1, None).await.unwrap();
    assert_eq!(session.compiled_summary(1).unwrap().memory.const_size, CONST_SIZE);

    assert!(matches!(
        session.set_graph_const_memory_base(1, DevicePtr(0x2000), 64).await,
        Err(SessionError::InvalidParameter(_))
    ));
    assert!(matches!(
        session.set_graph_const_memory_base(1, DevicePtr(0), CONST_SIZE).await,
        Err(SessionError::InvalidParameter(_))
    ));

    session
        .set_graph_const_memory_base(1, DevicePtr(0x2000), CONST_SIZE)
        .await
        .unwrap();
    assert!(matches!(
        session.set_graph_const_memory_base(1, DevicePtr(0x3000), CONST_SIZE).await,
        Err(SessionError::RepeatOperation(_))
    ));
    assert_eq!(
        session.compiled_summary(1).unwrap().bound_regions,
        vec![RegionKind::Const]
    );
}

#[tokio::test]
async fn test_const_memory_after_first_run() {
    let h = Harness::initialized().await;
    load(&h.session, 1, static_graph()).await;
    h.session
        .set_graph_const_memory_base(1, DevicePtr(0x2000), CONST_SIZE)
        .await
        .unwrap();

    load(&h.session, 2, static_graph()).await;
    h.session.run_graph(2, static_input()).await.unwrap();
    assert!(matches!(
        h.session
            .set_graph_const_memory_base(2, DevicePtr(0x2000), CONST_SIZE)
            .await,
        Err(SessionError::RepeatOperation(_))
    ));
}

#[tokio::test]
async fn test_feature_updates_reach_loaded_model() {
    let h = Harness::initialized().await;
    let session = &h.session;
    session.add_graph(1, static_graph(), Options::new()).unwrap();
    session.compile_graph(1, None).await.unwrap();
    session
        .update_graph_feature_memory_base(1, DevicePtr(0x1000), 0x100)
        .await
        .unwrap();
    session.load_graph(1, Options::new(), None).await.unwrap();

    let model = model_of(&h, 1);
    let bindings = h.executor.bindings(model);
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].ptr, DevicePtr(0x1000));

    session
        .update_graph_feature_memory_base(1, DevicePtr(0x5000), 0x100)
        .await
        .unwrap();
    session
        .update_graph_refreshable_feature_memory_base(1, DevicePtr(0x7000), 0x40)
        .await
        .unwrap();

    let bindings = h.executor.bindings(model);
    assert!(bindings
        .iter()
        .any(|b| b.region == RegionKind::Feature && b.ptr == DevicePtr(0x5000)));
    assert!(bindings
        .iter()
        .any(|b| b.region == RegionKind::RefreshableFeature && b.ptr == DevicePtr(0x7000)));
    assert!(!bindings.iter().any(|b| b.ptr == DevicePtr(0x1000)));

    session.run_graph(1, static_input()).await.unwrap();
}

#[tokio::test]
async fn test_fixed_feature_memory_before_load() {
    let h = Harness::initialized().await;
    let session = &h.session;
    session.add_graph(1, static_graph(), Options::new()).unwrap();
    session.compile_graph(1, None).await.unwrap();

    session
        .set_graph_fixed_feature_memory_base(1, MemoryType::P2p, DevicePtr(0x8000), 0x80)
        .await
        .unwrap();
    session.load_graph(1, Options::new(), None).await.unwrap();

    assert!(matches!(
        session
            .set_graph_fixed_feature_memory_base(1, MemoryType::Host, DevicePtr(0x9000), 0x80)
            .await,
        Err(SessionError::Unsupported(_))
    ));
    assert!(matches!(
        session
            .set_graph_fixed_feature_memory_base(1, MemoryType::P2p, DevicePtr(0x9000), 0x80)
            .await,
        Err(SessionError::RepeatOperation(_))
    ));
    assert_eq!(
        session.compiled_summary(1).unwrap().bound_regions,
        vec![RegionKind::FixedFeature(MemoryType::P2p)]
    );
}

#[tokio::test]
async fn test_bindings_rejected_while_running() {
    let h = Harness::initialized().await;
    load(&h.session, 1, static_graph()).await;
    h.executor.close_gate();

    let session = h.session.clone();
    let run = tokio::spawn(async move { session.run_graph(1, static_input()).await });
    let executor = h.executor.clone();
    assert!(wait_until(move || executor.active() == 1).await);

    assert!(matches!(
        h.session
            .update_graph_feature_memory_base(1, DevicePtr(0x5000), 0x100)
            .await,
        Err(SessionError::AlreadyRunning(_))
    ));

    h.executor.release(1);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bindings_released_with_graph() {
    let h = Harness::initialized().await;
    h.session.add_graph(1, static_graph(), Options::new()).unwrap();
    h.session.compile_graph(1, None).await.unwrap();
    h.session
        .set_graph_const_memory_base(1, DevicePtr(0x2000), CONST_SIZE)
        .await
        .unwrap();

    h.session.remove_graph(1).await.unwrap();
    h.session.add_graph(1, static_graph(), Options::new()).unwrap();
    h.session.compile_graph(1, None).await.unwrap();
    assert!(h.session.compiled_summary(1).unwrap().bound_regions.is_empty());
    h.session
        .set_graph_const_memory_base(1, DevicePtr(0x2000), CONST_SIZE)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pa_remapped_reconciles_loaded_models() {
    let h = Harness::initialized().await;
    assert!(matches!(
        h.session.pa_remapped(0x1000, 0x9000, 0x100),
        Err(SessionError::InvalidParameter(_))
    ));

    for (graph_id, base) in [(1, 0x1000), (2, 0x1100)] {
        h.session.add_graph(graph_id, static_graph(), Options::new()).unwrap();
        h.session.compile_graph(graph_id, None).await.unwrap();
        h.session
            .update_graph_feature_memory_base(graph_id, DevicePtr(base), 0x100)
            .await
            .unwrap();
    }

    // Compiled but nothing loaded: no model reports a range.
    assert!(matches!(
        h.session.pa_remapped(0x1000, 0x9000, 0x100),
        Err(SessionError::InvalidParameter(_))
    ));

    h.session.load_graph(1, Options::new(), None).await.unwrap();
    h.session.pa_remapped(0x1000, 0x9000, 0x100).unwrap();
    assert!(matches!(
        h.session.pa_remapped(0x1000, 0x9000, 0x200),
        Err(SessionError::InvalidParameter(_))
    ));

    h.session.load_graph(2, Options::new(), None).await.unwrap();
    h.session.pa_remapped(0x1000, 0x9000, 0x200).unwrap();
    h.session.pa_remapped(0x1080, 0x9000, 0x100).unwrap();
}

#[tokio::test]
async fn test_pa_remapped_requires_initialize() {
    let h = Harness::new();
    assert_eq!(
        h.session.pa_remapped(0x1000, 0x9000, 0x100),
        Err(SessionError::NotInitialized(h.session.session_id()))
    );
}

#[test]
fn test_reconciler_examples() {
    AddressRangeReconciler::reconcile(5, 26, vec![(10, 20), (21, 30), (5, 9)]).unwrap();
    assert!(matches!(
        AddressRangeReconciler::reconcile(5, 26, vec![(10, 20), (25, 30)]),
        Err(SessionError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn test_external_allocator_places_stream_outputs() {
    let h = Harness::initialized().await;
    load(&h.session, 1, static_graph()).await;
    let stream = h.device.create_stream().unwrap();
    let allocator = Arc::new(CountingAllocator::new());
    h.session.register_external_allocator(stream, allocator.clone());

    let outputs = h
        .session
        .run_graph_with_stream_async(1, stream, static_input(), Vec::new())
        .await
        .unwrap();
    assert_eq!(allocator.allocated(), 1);
    assert_eq!(outputs[0].desc, TensorDesc::new(vec![3], DType::F32));
    assert_eq!(outputs[0].data.data_ptr(), 0x10_0000);
    assert!(outputs[0].data.host_bytes().is_none());

    h.executor.fail_next();
    assert!(h
        .session
        .run_graph_with_stream_async(1, stream, static_input(), Vec::new())
        .await
        .is_err());
    assert_eq!(allocator.allocated(), 2);
    assert_eq!(allocator.freed(), 1);

    assert!(h.session.unregister_external_allocator(stream));
    let outputs = h
        .session
        .run_graph_with_stream_async(1, stream, static_input(), Vec::new())
        .await
        .unwrap();
    assert_eq!(allocator.allocated(), 2);
    assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![10.0; 3]);
}

#[tokio::test]
async fn test_allocator_registration_is_process_wide() {
    let first = Harness::initialized().await;
    let second = Harness::with_global(first.global.clone(), Options::new());
    second.session.initialize().await.unwrap();
    load(&second.session, 1, static_graph()).await;

    let stream = second.device.create_stream().unwrap();
    let allocator = Arc::new(CountingAllocator::new());
    first.session.register_external_allocator(stream, allocator.clone());

    second
        .session
        .run_graph_with_stream_async(1, stream, static_input(), Vec::new())
        .await
        .unwrap();
    assert_eq!(allocator.allocated(), 1);
    assert_ne!(first.session.session_id(), second.session.session_id());
}

#[tokio::test]
async fn test_caller_device_outputs_are_filled_in_place() {
    let h = Harness::initialized().await;
    load(&h.session, 1, static_graph()).await;
    let stream = h.device.create_stream().unwrap();

    let desc = TensorDesc::new(vec![3], DType::F32);
    let user = vec![Tensor::device(desc.clone(), DevicePtr(0xA000), 12)];
    let outputs = h
        .session
        .run_graph_with_stream_async(1, stream, static_input(), user)
        .await
        .unwrap();
    assert_eq!(outputs[0].desc, desc);
    assert_eq!(outputs[0].data.data_ptr(), 0xA000);

    let wrong = vec![
        Tensor::device(desc.clone(), DevicePtr(0xA000), 12),
        Tensor::device(desc, DevicePtr(0xB000), 12),
    ];
    assert!(matches!(
        h.session
            .run_graph_with_stream_async(1, stream, static_input(), wrong)
            .await,
        Err(SessionError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn test_external_blocks_freed_when_outputs_missing() {
    let h = Harness::initialized().await;
    load(&h.session, 1, static_graph()).await;
    let stream = h.device.create_stream().unwrap();
    let allocator = Arc::new(CountingAllocator::new());
    h.session.register_external_allocator(stream, allocator.clone());

    h.executor.drop_outputs_next();
    let err = h
        .session
        .run_graph_with_stream_async(1, stream, static_input(), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Internal(_)));
    assert_eq!(allocator.allocated(), 1);
    assert_eq!(allocator.freed(), 1);

    h.session
        .run_graph_with_stream_async(1, stream, static_input(), Vec::new())
        .await
        .unwrap();
    assert_eq!(allocator.allocated(), 2);
    assert_eq!(allocator.freed(), 1);
}
