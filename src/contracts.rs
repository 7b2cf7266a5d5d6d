// src/contracts.rs
use ethers::contract::abigen;

// EntryPoint v0.7. `simulateHandleOp` only exists on the simulations contract, which is served at
// the entry point address through a code override during simulation.
abigen!(
    IEntryPoint,
    r#"[
        struct PackedUserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; bytes32 accountGasLimits; uint256 preVerificationGas; bytes32 gasFees; bytes paymasterAndData; bytes signature; }
        struct UserOpsPerAggregator { PackedUserOperation[] userOps; address aggregator; bytes signature; }
        struct ExecutionResult { uint256 preOpGas; uint256 paid; uint256 accountValidationData; uint256 paymasterValidationData; bool targetSuccess; bytes targetResult; }

        function handleOps(PackedUserOperation[] ops, address beneficiary)
        function handleAggregatedOps(UserOpsPerAggregator[] opsPerAggregator, address beneficiary)
        function getUserOpHash(PackedUserOperation userOp) view returns (bytes32)
        function simulateHandleOp(PackedUserOperation op, address target, bytes targetCallData) returns (ExecutionResult)

        event BeforeExecution()
        event UserOperationEvent(bytes32 indexed userOpHash, address indexed sender, address indexed paymaster, uint256 nonce, bool success, uint256 actualGasCost, uint256 actualGasUsed)
    ]"#
);
