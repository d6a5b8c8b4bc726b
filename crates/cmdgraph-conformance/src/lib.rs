pub mod atomics;
pub mod graph_scenarios;
pub mod joint_matrix;
pub mod recording_device;
pub mod spec_constants;

/// Expands to a test module running every conformance scenario against one backend.
///
/// `$backend_ctor` is any expression callable with no arguments that yields an
/// `Arc<dyn DeviceBackend>`; it is invoked once per test.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use std::sync::Arc;

            use cmdgraph::backend::spec::DeviceBackend;

            fn backend() -> Arc<dyn DeviceBackend> {
                let _ = env_logger::builder().is_test(true).try_init();
                ($backend_ctor)()
            }

            macro_rules! scenario_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() -> anyhow::Result<()> {
                        $func(backend())
                    }
                };
            }

            scenario_test!(graph_usm_copy_in_order, $crate::graph_scenarios::usm_copy_in_order);
            scenario_test!(
                graph_operations_outside_recording_are_not_captured,
                $crate::graph_scenarios::operations_outside_recording_are_not_captured
            );
            scenario_test!(graph_replay_is_idempotent, $crate::graph_scenarios::replay_is_idempotent);
            scenario_test!(
                graph_independent_operations_share_one_wave,
                $crate::graph_scenarios::independent_operations_share_one_wave
            );
            scenario_test!(
                graph_conflicting_operations_are_ordered,
                $crate::graph_scenarios::conflicting_operations_are_ordered
            );
            scenario_test!(graph_buffer_copy_2d, $crate::graph_scenarios::buffer_copy_2d);
            scenario_test!(
                graph_concurrent_submitters_keep_queue_order,
                $crate::graph_scenarios::concurrent_submitters_keep_queue_order
            );
            scenario_test!(graph_recording_usage_errors, $crate::graph_scenarios::recording_usage_errors);
            scenario_test!(
                graph_device_failure_surfaces_on_wait,
                $crate::graph_scenarios::device_failure_surfaces_on_wait
            );

            scenario_test!(
                spec_constants_alternating_submissions_select_images,
                $crate::spec_constants::alternating_submissions_select_images
            );
            scenario_test!(
                spec_constants_alternating_without_baked_image,
                $crate::spec_constants::alternating_without_baked_image
            );
            scenario_test!(
                spec_constants_alternating_submissions_in_graph,
                $crate::spec_constants::alternating_submissions_in_graph
            );
            scenario_test!(
                spec_constants_kernel_bundle_carries_constants,
                $crate::spec_constants::kernel_bundle_carries_constants
            );
            scenario_test!(
                spec_constants_explicit_constant_requires_configurable_image,
                $crate::spec_constants::explicit_constant_requires_configurable_image
            );

            scenario_test!(atomics_dword_add_and_inc, $crate::atomics::dword_atomic_add_and_inc);
            scenario_test!(atomics_dword_cmpxchg, $crate::atomics::dword_atomic_cmpxchg);
            scenario_test!(
                atomics_dword_float_and_bitwise,
                $crate::atomics::dword_atomic_float_and_bitwise
            );
            scenario_test!(
                atomics_dword_invalid_use_fails,
                $crate::atomics::dword_atomic_invalid_use_fails
            );

            scenario_test!(joint_matrix_bf16_32x64, $crate::joint_matrix::bf16_matmul_32x64);
            scenario_test!(
                joint_matrix_bf16_col_major_operands,
                $crate::joint_matrix::bf16_matmul_col_major_operands
            );
            scenario_test!(
                joint_matrix_packed_tile_misuse_fails,
                $crate::joint_matrix::packed_tile_misuse_fails
            );

            #[test]
            fn recording_device_wraps_backend() -> anyhow::Result<()> {
                let device = Arc::new($crate::recording_device::RecordingDevice::new(backend()));
                device.fail_kernel("conformance_failing");
                let ctx = cmdgraph::runtime::Context::with_config(
                    device.clone(),
                    cmdgraph::RuntimeConfig::default(),
                );
                let queue = cmdgraph::runtime::Queue::new(&ctx);
                let failing = cmdgraph::Kernel::new("conformance_failing", |_, _| Ok(()));
                let event = queue.submit(|cgh| cgh.single_task(&failing))?;
                anyhow::ensure!(event.wait().is_err());
                anyhow::ensure!(device.executed().is_empty());
                Ok(())
            }
        }
    };
}
