//! Bindings for the oracle contracts the node listens to and reports into.
//!
//! Only the events and calls the node touches are declared here. Field names
//! follow the deployed contracts so that ABI encoding matches byte for byte.

#![allow(missing_docs)]

/// `Aggregator.sol` bindings (data feed rounds).
pub mod aggregator {
    alloy::sol! {
        #[derive(Debug, PartialEq, Eq)]
        interface IAggregator {
            event NewRound(uint256 indexed roundId, address indexed startedBy, uint256 startedAt);

            function submit(uint256 _roundId, int256 _submission) external;

            function oracleRoundState(address _oracle, uint32 _queriedRoundId)
                external
                view
                returns (
                    bool _eligibleToSubmit,
                    uint32 _roundId,
                    int256 _latestSubmission,
                    uint64 _startedAt,
                    uint64 _timeout,
                    uint8 _oracleCount
                );

            function currentRoundStartedAt() external view returns (uint256);
        }
    }
}

/// `VRFCoordinator.sol` bindings.
pub mod vrf_coordinator {
    alloy::sol! {
        #[derive(Debug, PartialEq, Eq)]
        interface IVRFCoordinator {
            struct Proof {
                uint256[2] pk;
                uint256[4] proof;
                uint256 seed;
                uint256[2] uPoint;
                uint256[4] vComponents;
            }

            struct RequestCommitment {
                uint64 blockNum;
                uint64 accId;
                uint32 callbackGasLimit;
                uint32 numWords;
                address sender;
            }

            event RandomWordsRequested(
                bytes32 indexed keyHash,
                uint256 requestId,
                uint256 preSeed,
                uint64 indexed accId,
                uint32 callbackGasLimit,
                uint32 numWords,
                address indexed sender,
                bool isDirectPayment
            );

            function fulfillRandomWords(
                Proof memory proof,
                RequestCommitment memory rc,
                bool isDirectPayment
            ) external;
        }
    }
}

/// `RequestResponseCoordinator.sol` bindings.
pub mod request_response_coordinator {
    alloy::sol! {
        #[derive(Debug, PartialEq, Eq)]
        interface IRequestResponseCoordinator {
            struct RequestCommitment {
                uint64 blockNum;
                uint64 accId;
                uint8 numSubmission;
                uint32 callbackGasLimit;
                address sender;
            }

            event DataRequested(
                uint256 indexed requestId,
                bytes32 jobId,
                uint64 indexed accId,
                uint32 callbackGasLimit,
                address indexed sender,
                bool isDirectPayment,
                uint8 numSubmission,
                bytes data
            );

            function fulfillDataRequestUint128(
                uint256 requestId,
                uint128 response,
                RequestCommitment memory rc,
                bool isDirectPayment
            ) external;

            function fulfillDataRequestInt256(
                uint256 requestId,
                int256 response,
                RequestCommitment memory rc,
                bool isDirectPayment
            ) external;

            function fulfillDataRequestBool(
                uint256 requestId,
                bool response,
                RequestCommitment memory rc,
                bool isDirectPayment
            ) external;

            function fulfillDataRequestString(
                uint256 requestId,
                string memory response,
                RequestCommitment memory rc,
                bool isDirectPayment
            ) external;

            function fulfillDataRequestBytes32(
                uint256 requestId,
                bytes32 response,
                RequestCommitment memory rc,
                bool isDirectPayment
            ) external;

            function fulfillDataRequestBytes(
                uint256 requestId,
                bytes memory response,
                RequestCommitment memory rc,
                bool isDirectPayment
            ) external;
        }
    }
}
