use std::sync::Arc;

use rllm_runner::{
    attn::{FlashAttnMetadata, PagedAttnMetadata},
    broadcast::{init_sampling_metadata_from_tensor_dict, SAMPLING_METADATA_KEY},
    sampling::{SamplingMetadata, SamplingScope, SELECTED_TOKEN_INDICES},
    schema::{Record, RecordSchema},
    seq::{SequenceData, SequenceGroupMetadata},
    tensor::{from_vec1, same_contents},
    AttentionBackend, AttentionMetadata, BroadcastableModelInput, Device, FlashAttnBackend,
    HashMap, ModelInput, ModelInputBuilder, ModelRunnerInputBuilder, PagedAttnBackend,
    RunnerConfig, RunnerError, SamplingParams, StatefulModelInput, Tensor, TensorDict, Value,
};

fn config() -> Arc<RunnerConfig> {
    Arc::new(RunnerConfig {
        block_size: 4,
        dump_input_on_error: false,
        ..RunnerConfig::default()
    })
}

fn prompt_group(
    request_id: &str,
    seq_id: u64,
    prompt: &[u32],
    blocks: &[usize],
) -> SequenceGroupMetadata {
    let mut block_tables = HashMap::default();
    block_tables.insert(seq_id, blocks.to_vec());
    SequenceGroupMetadata {
        request_id: request_id.to_string(),
        is_prompt: true,
        seq_data: vec![SequenceData::new(seq_id, prompt)],
        sampling_params: SamplingParams::default(),
        block_tables,
        token_chunk_size: None,
    }
}

fn decode_group(
    request_id: &str,
    seq_id: u64,
    prompt: &[u32],
    output: &[u32],
    blocks: &[usize],
) -> SequenceGroupMetadata {
    let data = SequenceData::new(seq_id, prompt).with_output(output);
    let computed = data.get_len() - 1;
    let mut sg = prompt_group(request_id, seq_id, prompt, blocks);
    sg.is_prompt = false;
    sg.seq_data = vec![data.with_computed(computed)];
    sg
}

fn build<B: AttentionBackend>(
    backend: B,
    groups: &[SequenceGroupMetadata],
    finished: Option<Vec<String>>,
) -> ModelInput<B::Metadata> {
    let mut builder =
        ModelInputBuilder::new(config(), Arc::new(backend), Device::Cpu, 1, finished);
    for sg in groups {
        builder.add_seq_group(sg).unwrap();
    }
    builder.build().unwrap()
}

fn mixed_batch() -> Vec<SequenceGroupMetadata> {
    vec![
        prompt_group("A", 1, &[11, 12, 13, 14, 15], &[2, 5]),
        decode_group("B", 2, &[21, 22, 23], &[24, 25], &[0, 1]),
    ]
}

fn tensor(data: Vec<u32>) -> Tensor {
    from_vec1(data, &Device::Cpu).unwrap()
}

fn fields_of<R: Record>(record: &R) -> TensorDict {
    let mut d = TensorDict::new();
    record.write_fields(&mut d);
    d
}

fn check_broadcastable_fields<M: AttentionMetadata>(orig: &ModelInput<M>, rebuilt: &ModelInput<M>) {
    assert!(same_contents(rebuilt.input_tokens(), orig.input_tokens()));
    assert!(same_contents(
        rebuilt.input_positions(),
        orig.input_positions()
    ));
    assert_eq!(rebuilt.virtual_engine(), orig.virtual_engine());
    assert_eq!(rebuilt.is_prompt(), orig.is_prompt());
    assert_eq!(
        rebuilt.request_ids_to_seq_ids(),
        orig.request_ids_to_seq_ids()
    );
    assert_eq!(
        rebuilt.finished_requests_ids(),
        orig.finished_requests_ids()
    );
    assert_eq!(
        fields_of(rebuilt.attn_metadata().unwrap()),
        fields_of(orig.attn_metadata().unwrap())
    );

    let sm = rebuilt.sampling_metadata().unwrap();
    assert_eq!(sm.scope(), SamplingScope::IndicesOnly);
    assert!(sm.seq_groups().is_none());
    assert!(same_contents(
        sm.selected_token_indices(),
        orig.sampling_metadata().unwrap().selected_token_indices()
    ));

    // device-only
    assert!(rebuilt.layout().is_none());
    assert!(rebuilt.seq_lens().is_empty());
    assert!(rebuilt.query_lens().is_empty());
}

#[test]
fn test_flash_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let input = build(
        FlashAttnBackend,
        &mixed_batch(),
        Some(vec!["Z".to_string()]),
    );
    assert_eq!(
        input.input_tokens().to_vec1::<u32>().unwrap(),
        vec![11, 12, 13, 14, 15, 25]
    );
    assert_eq!(
        input.input_positions().to_vec1::<i64>().unwrap(),
        vec![0, 1, 2, 3, 4, 4]
    );
    assert_eq!(input.is_prompt(), None);
    assert_eq!(input.seq_lens(), vec![5, 5]);
    assert_eq!(input.query_lens(), vec![5, 1]);

    let dict = input.as_broadcastable_tensor_dict();
    let rebuilt = ModelInput::from_broadcasted_tensor_dict(dict.clone(), Some(&FlashAttnBackend))
        .unwrap();
    check_broadcastable_fields(&input, &rebuilt);
    assert_eq!(rebuilt.as_broadcastable_tensor_dict(), dict);
}

#[test]
fn test_paged_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let input = build(PagedAttnBackend, &mixed_batch(), None);
    let md = input.attn_metadata().unwrap();
    assert_eq!(md.block_tables.dims(), &[2, 2]);
    assert_eq!(
        md.block_tables.to_vec2::<u32>().unwrap(),
        vec![vec![2, 5], vec![0, 1]]
    );
    assert_eq!(
        md.slot_mapping.to_vec1::<i64>().unwrap(),
        vec![8, 9, 10, 11, 20, 4]
    );

    let dict = input.as_broadcastable_tensor_dict();
    assert!(dict.contains_key("block_tables"));
    assert!(!dict.contains_key("finished_requests_ids"));
    let rebuilt: ModelInput<PagedAttnMetadata> =
        ModelInput::from_broadcasted_tensor_dict(dict, Some(&PagedAttnBackend)).unwrap();
    check_broadcastable_fields(&input, &rebuilt);
    assert_eq!(rebuilt.finished_requests_ids(), None);
}

#[test]
fn test_extra_keys_are_ignored() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let mut dict = input.as_broadcastable_tensor_dict();
    dict.insert(
        "some_future_field",
        from_vec1(vec![1.5f32], &Device::Cpu).unwrap(),
    );
    dict.insert("another_one", "hello");
    let rebuilt = ModelInput::from_broadcasted_tensor_dict(dict, Some(&FlashAttnBackend))
        .unwrap();
    check_broadcastable_fields(&input, &rebuilt);
}

#[test]
fn test_missing_key_is_named() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let mut dict = input.as_broadcastable_tensor_dict();
    dict.remove("input_positions");
    let err = ModelInput::from_broadcasted_tensor_dict(dict, Some(&FlashAttnBackend)).unwrap_err();
    assert_eq!(
        RunnerError::from_anyhow(&err),
        Some(&RunnerError::MissingField {
            record: "ModelInput",
            field: "input_positions",
        })
    );
    assert!(format!("{}", err).contains("input_positions"));
}

#[test]
fn test_wrong_kind_is_rejected() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let mut dict = input.as_broadcastable_tensor_dict();
    dict.insert("virtual_engine", "one");
    let err = ModelInput::from_broadcasted_tensor_dict(dict, Some(&FlashAttnBackend)).unwrap_err();
    match RunnerError::from_anyhow(&err) {
        Some(RunnerError::FieldType { field, .. }) => assert_eq!(*field, "virtual_engine"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_no_backend_no_attn_metadata() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let dict = input.as_broadcastable_tensor_dict();
    let rebuilt =
        ModelInput::<FlashAttnMetadata>::from_broadcasted_tensor_dict::<FlashAttnBackend>(
            dict, None,
        )
        .unwrap();
    assert!(rebuilt.attn_metadata().is_none());
    assert!(same_contents(rebuilt.input_tokens(), input.input_tokens()));
}

#[test]
fn test_builder_keeps_order() {
    let groups = vec![
        prompt_group("A", 1, &[1, 2], &[0]),
        prompt_group("B", 2, &[3], &[1]),
        prompt_group("C", 3, &[4, 5, 6], &[2]),
    ];
    let input = build(FlashAttnBackend, &groups, None);
    assert_eq!(
        input.input_tokens().to_vec1::<u32>().unwrap(),
        vec![1, 2, 3, 4, 5, 6]
    );
    assert_eq!(input.is_prompt(), Some(true));
    let sm = input.sampling_metadata().unwrap();
    assert_eq!(sm.scope(), SamplingScope::Full);
    assert_eq!(sm.num_prompts(), 3);
    let ids = sm
        .seq_groups()
        .unwrap()
        .iter()
        .map(|g| g.request_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["A", "B", "C"]);
    assert_eq!(
        sm.selected_token_indices().to_vec1::<i64>().unwrap(),
        vec![1, 2, 5]
    );
}

#[test]
fn test_empty_batch() {
    let input = build(FlashAttnBackend, &[], None);
    assert_eq!(input.num_tokens(), 0);
    assert_eq!(input.is_prompt(), None);
    assert_eq!(input.attn_metadata().unwrap().max_seqlen_q, 0);

    let dict = input.as_broadcastable_tensor_dict();
    let rebuilt = ModelInput::from_broadcasted_tensor_dict(dict, Some(&FlashAttnBackend))
        .unwrap();
    assert_eq!(rebuilt.num_tokens(), 0);
}

#[test]
fn test_sampling_shortcut() {
    let mut dict = TensorDict::new();
    dict.insert(
        SELECTED_TOKEN_INDICES,
        from_vec1(vec![0i64, 2, 5], &Device::Cpu).unwrap(),
    );
    init_sampling_metadata_from_tensor_dict(&mut dict).unwrap();
    let sm: SamplingMetadata = dict.take_record(SAMPLING_METADATA_KEY).unwrap().unwrap();
    assert_eq!(sm.scope(), SamplingScope::IndicesOnly);
    assert_eq!(
        sm.selected_token_indices().to_vec1::<i64>().unwrap(),
        vec![0, 2, 5]
    );
}

#[test]
fn test_stateful_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let s0 = StatefulModelInput::new(input, 4);
    let s1 = s0
        .advance_step(&FlashAttnBackend, Some(tensor(vec![16, 26])))
        .unwrap();

    let dict = s1.as_broadcastable_tensor_dict();
    assert_eq!(dict.get("current_step"), Some(&Value::Int(1)));
    assert_eq!(dict.get("num_steps"), Some(&Value::Int(4)));
    assert!(dict.contains_key("step.slot_mapping"));
    let rebuilt: StatefulModelInput<FlashAttnMetadata> =
        StatefulModelInput::from_broadcasted_tensor_dict(dict.clone(), Some(&FlashAttnBackend))
            .unwrap();

    assert_eq!(rebuilt.num_steps(), 4);
    assert_eq!(rebuilt.current_step(), 1);
    assert!(rebuilt.is_multi_step());
    assert!(!rebuilt.is_first_multi_step());
    assert!(!rebuilt.is_last_step());
    assert_eq!(rebuilt.num_seqs(), 2);
    assert_eq!(rebuilt.num_queries(), 2);
    assert_eq!(
        rebuilt
            .last_sampled_token_ids()
            .unwrap()
            .to_vec1::<u32>()
            .unwrap(),
        vec![16, 26]
    );
    assert_eq!(
        rebuilt
            .attn_metadata()
            .unwrap()
            .slot_mapping
            .to_vec1::<i64>()
            .unwrap(),
        vec![21, 5]
    );
    check_broadcastable_fields(s1.frozen_model_input(), rebuilt.frozen_model_input());
    assert_eq!(rebuilt.as_broadcastable_tensor_dict(), dict);
}

#[test]
fn test_frozen_and_per_step_split() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let s0 = StatefulModelInput::new(input, 4);
    assert!(s0.is_first_multi_step());
    let frozen = s0.frozen_model_input().as_broadcastable_tensor_dict();

    let s1 = s0.advance_step(&FlashAttnBackend, None).unwrap();
    let s2 = s1.advance_step(&FlashAttnBackend, None).unwrap();
    let s3 = s2.advance_step(&FlashAttnBackend, None).unwrap();
    for (i, s) in [&s1, &s2, &s3].iter().enumerate() {
        assert!(s.shares_frozen_with(&s0));
        assert_eq!(s.frozen_model_input().as_broadcastable_tensor_dict(), frozen);
        assert_eq!(s.current_step(), i + 1);
        assert!(!s.is_first_multi_step());
        assert_eq!(s.attn_metadata().unwrap().max_seqlen_k, 5 + i + 1);
    }
    assert_eq!(s0.current_step(), 0);
    assert_eq!(s0.attn_metadata().unwrap().max_seqlen_k, 5);
    assert!(!s2.is_last_step());
    assert!(s3.is_last_step());
    assert!(s3.advance_step(&FlashAttnBackend, None).is_err());
}

#[test]
fn test_step_metadata_matches_step_tokens() {
    let input = build(PagedAttnBackend, &mixed_batch(), None);
    let s0 = StatefulModelInput::new(input, 3);
    let s1 = s0
        .advance_step(&PagedAttnBackend, Some(tensor(vec![16, 26])))
        .unwrap();
    let s2 = s1
        .advance_step(&PagedAttnBackend, Some(tensor(vec![17, 27])))
        .unwrap();
    for s in [&s0, &s1, &s2] {
        let md = s.attn_metadata().unwrap();
        assert_eq!(
            md.slot_mapping().elem_count(),
            s.step_tokens().elem_count()
        );
        assert_eq!(md.num_seqs(), 2);
    }
    let md = s2.attn_metadata().unwrap();
    assert_eq!(md.slot_mapping.to_vec1::<i64>().unwrap(), vec![22, 6]);
    assert_eq!(md.context_lens.to_vec1::<u32>().unwrap(), vec![7, 7]);

    // one sampled token per sequence
    assert!(s1
        .advance_step(&PagedAttnBackend, Some(tensor(vec![17])))
        .is_err());
}

#[test]
fn test_step_positions() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let s0 = StatefulModelInput::new(input, 3);
    let s2 = s0
        .advance_step(&FlashAttnBackend, Some(tensor(vec![16, 26])))
        .unwrap()
        .advance_step(&FlashAttnBackend, Some(tensor(vec![17, 27])))
        .unwrap();
    assert_eq!(s2.step_tokens().to_vec1::<u32>().unwrap(), vec![17, 27]);
    assert_eq!(
        s2.step_positions().unwrap().to_vec1::<i64>().unwrap(),
        vec![6, 6]
    );
}

#[test]
fn test_serde_json_round_trip() {
    let input = build(PagedAttnBackend, &mixed_batch(), Some(vec!["Q".to_string()]));
    let dict = input.as_broadcastable_tensor_dict();
    let json = serde_json::to_string(&dict).unwrap();
    let dict2: TensorDict = serde_json::from_str(&json).unwrap();
    assert_eq!(dict2, dict);
}

#[test]
fn test_with_finished_requests_ids() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let input2 = input.with_finished_requests_ids(Some(vec!["A".to_string()]));
    assert_eq!(input.finished_requests_ids(), None);
    assert_eq!(input2.finished_requests_ids(), Some(&["A".to_string()][..]));
    assert!(same_contents(input2.input_tokens(), input.input_tokens()));
}

fn check_each_required_field<I, B>(input: &I, backend: &B, schema: &RecordSchema)
where
    I: BroadcastableModelInput,
    B: AttentionBackend<Metadata = I::AttnMetadata>,
{
    let dict = input.as_broadcastable_tensor_dict();
    let mut checked = 0;
    for field in schema.required_fields() {
        let mut d = dict.clone();
        assert!(d.remove(field).is_some(), "{} not emitted", field);
        let err = match I::from_broadcasted_tensor_dict(d, Some(backend)) {
            Ok(_) => panic!("{}.{} was not required", schema.name, field),
            Err(e) => e,
        };
        assert_eq!(
            RunnerError::from_anyhow(&err),
            Some(&RunnerError::MissingField {
                record: schema.name,
                field,
            })
        );
        checked += 1;
    }
    assert!(checked > 0);
}

#[test]
fn test_every_required_field_is_named() {
    let flash = build(FlashAttnBackend, &mixed_batch(), None);
    let paged = build(PagedAttnBackend, &mixed_batch(), None);

    check_each_required_field(
        &flash,
        &FlashAttnBackend,
        &<ModelInput<FlashAttnMetadata> as Record>::SCHEMA,
    );
    check_each_required_field(&flash, &FlashAttnBackend, &FlashAttnMetadata::SCHEMA);
    check_each_required_field(&paged, &PagedAttnBackend, &PagedAttnMetadata::SCHEMA);

    let stateful = StatefulModelInput::new(flash, 2);
    check_each_required_field(
        &stateful,
        &FlashAttnBackend,
        &<StatefulModelInput<FlashAttnMetadata> as Record>::SCHEMA,
    );
}

#[test]
fn test_emitted_keys_match_schemas() {
    let groups = vec![
        prompt_group("A", 1, &[1, 2], &[0]),
        prompt_group("B", 2, &[3], &[1]),
    ];
    let input = build(PagedAttnBackend, &groups, Some(vec!["Z".to_string()]));
    let mut keys = input
        .as_broadcastable_tensor_dict()
        .keys()
        .map(|k| k.to_string())
        .collect::<Vec<_>>();
    keys.sort();

    let mut declared = <ModelInput<PagedAttnMetadata> as Record>::SCHEMA
        .field_names()
        .chain(PagedAttnMetadata::SCHEMA.field_names())
        .chain(SamplingMetadata::SCHEMA.field_names())
        .map(|k| k.to_string())
        .collect::<Vec<_>>();
    declared.sort();
    assert_eq!(keys, declared);
}

#[test]
fn test_negative_count_is_out_of_range() {
    let input = build(FlashAttnBackend, &mixed_batch(), None);
    let mut dict = input.as_broadcastable_tensor_dict();
    dict.insert("virtual_engine", -1i64);
    let err = ModelInput::from_broadcasted_tensor_dict(dict, Some(&FlashAttnBackend)).unwrap_err();
    assert_eq!(
        RunnerError::from_anyhow(&err),
        Some(&RunnerError::FieldRange {
            record: "ModelInput",
            field: "virtual_engine",
            value: -1,
        })
    );
}
